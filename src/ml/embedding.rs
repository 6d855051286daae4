//! 事前学習済み特徴抽出器（MobileNetV2）
//!
//! Model B の入力となる1280次元の埋め込みを画像から計算します。
//! データセット構築と推論には `FeatureExtractor` トレイトとして渡すため、
//! 重みの読み込みはコマンドごとに1回だけ行われます。
//!
//! 重みは次のどちらかから読み込みます。
//! - torchvision の `mobilenet_v2` (width 1.0) の state dict（`.pth` / `.pt`）
//! - `convert_extractor` で変換した Burn named MessagePack レコード（`.mpk`）
//!
//! torchvision の state dict は zip 形式で保存されたものが必要です:
//!
//! ```text
//! torch.save(torchvision.models.mobilenet_v2(weights="IMAGENET1K_V1").state_dict(),
//!            "models/mobilenet_v2.pth")
//! ```

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::error::{RaterError, Result};
use crate::ml::image_loader::ImageTensor;
use crate::ml::ml_model::EMBEDDING_DIM;

/// 画像から固定長の埋め込みを計算する能力
pub trait FeatureExtractor {
    /// 埋め込みの次元
    fn embedding_dim(&self) -> usize;

    /// `[1, H, W, C]` の画像テンソルから埋め込みを計算
    fn infer(&self, image: &ImageTensor) -> Result<Vec<f32>>;
}

/// 反転残差ブロックの構成 (expand_ratio, out_channels, repeats, first_stride)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// ImageNet の平均と標準偏差（RGB）
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 反転残差ブロックの総数
fn num_blocks() -> usize {
    INVERTED_RESIDUAL_SETTINGS
        .iter()
        .map(|(_, _, repeats, _)| repeats)
        .sum()
}

/// MobileNetV2 特徴抽出部の設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 最終特徴数
    #[config(default = 1280)]
    pub last_channels: usize,
}

impl MobileNetV2Config {
    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let stem = ConvNorm::new(3, 32, 3, 2, 1, device);

        let mut blocks = Vec::with_capacity(num_blocks());
        let mut in_channels = 32;
        for (expand_ratio, out_channels, repeats, first_stride) in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expand_ratio,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvNorm::new(in_channels, self.last_channels, 1, 1, 1, device);

        MobileNetV2 { stem, blocks, head }
    }
}

/// 畳み込み（バイアスなし） + BatchNorm
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(input))
    }
}

fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// 反転残差ブロック
///
/// expand (1x1) -> depthwise (3x3) -> project (1x1, 線形)。
/// 入出力の形状が一致するとき（stride 1 かつ同チャネル数）は残差接続を加える。
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    project: ConvNorm<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1).then(|| ConvNorm::new(in_channels, hidden, 1, 1, 1, device));

        Self {
            expand,
            depthwise: ConvNorm::new(hidden, hidden, 3, stride, hidden, device),
            project: ConvNorm::new(hidden, out_channels, 1, 1, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => relu6(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = relu6(self.depthwise.forward(x));
        let x = self.project.forward(x);

        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2 の特徴抽出部（分類層なし）
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNorm<B>,
    blocks: Vec<InvertedResidual<B>>,
    head: ConvNorm<B>,
}

impl<B: Backend> MobileNetV2<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: [batch_size, 3, H, W]、ImageNet の平均・標準偏差で正規化済み
    ///
    /// # 戻り値
    /// - グローバル平均プーリング後の特徴 [batch_size, last_channels]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu6(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = relu6(self.head.forward(x));

        let [batch_size, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
    }
}

/// torchvision の state dict のキーを `MobileNetV2` のフィールドへ対応付ける正規表現
///
/// - `features.0` -> `stem`
/// - `features.1 ..= features.17` -> `blocks.0 ..= blocks.16`
/// - `features.18` -> `head`
///
/// `classifier.*` は対応先がないため読み込まれない。
pub fn torchvision_key_remaps() -> Vec<(String, String)> {
    let mut remaps = vec![
        (r"^features\.0\.0\.(.+)$".to_string(), "stem.conv.${1}".to_string()),
        (r"^features\.0\.1\.(.+)$".to_string(), "stem.norm.${1}".to_string()),
    ];

    // 拡張なしブロック: conv.0 = depthwise (conv, bn), conv.1 = project conv, conv.2 = project bn
    for (from, to) in [
        (r"conv\.0\.0", "depthwise.conv"),
        (r"conv\.0\.1", "depthwise.norm"),
        (r"conv\.1", "project.conv"),
        (r"conv\.2", "project.norm"),
    ] {
        remaps.push((
            format!(r"^features\.1\.{}\.(.+)$", from),
            format!("blocks.0.{}.${{1}}", to),
        ));
    }

    let last = num_blocks();
    for feature in 2..=last {
        for (from, to) in [
            (r"conv\.0\.0", "expand.conv"),
            (r"conv\.0\.1", "expand.norm"),
            (r"conv\.1\.0", "depthwise.conv"),
            (r"conv\.1\.1", "depthwise.norm"),
            (r"conv\.2", "project.conv"),
            (r"conv\.3", "project.norm"),
        ] {
            remaps.push((
                format!(r"^features\.{}\.{}\.(.+)$", feature, from),
                format!("blocks.{}.{}.${{1}}", feature - 1, to),
            ));
        }
    }

    let head = last + 1;
    remaps.push((
        format!(r"^features\.{}\.0\.(.+)$", head),
        "head.conv.${1}".to_string(),
    ));
    remaps.push((
        format!(r"^features\.{}\.1\.(.+)$", head),
        "head.norm.${1}".to_string(),
    ));

    remaps
}

fn is_torchvision_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("pth") | Some("pt")
    )
}

/// torchvision の state dict を読み込む
fn load_torchvision<B: Backend>(path: &Path, device: &B::Device) -> Result<MobileNetV2<B>> {
    let mut args = LoadArgs::new(path.to_path_buf());
    for (pattern, replacement) in torchvision_key_remaps() {
        args = args.with_key_remap(&pattern, &replacement);
    }

    let record: MobileNetV2Record<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|e| RaterError::model_load(path, format!("{:?}", e)))?;

    Ok(MobileNetV2Config::new().init::<B>(device).load_record(record))
}

/// 変換済みの named MessagePack レコードを読み込む
fn load_named_mpk<B: Backend>(path: &Path, device: &B::Device) -> Result<MobileNetV2<B>> {
    MobileNetV2Config::new()
        .init::<B>(device)
        .load_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| RaterError::model_load(path, format!("{:?}", e)))
}

/// 重みファイルを読み込む
///
/// 拡張子が `.pth` / `.pt` なら torchvision の state dict、それ以外は
/// named MessagePack レコード（拡張子 .mpk は省略可）として扱う。
pub fn load_mobilenet_v2<B: Backend>(path: &Path, device: &B::Device) -> Result<MobileNetV2<B>> {
    let file = if is_torchvision_file(path) {
        path.to_path_buf()
    } else {
        path.with_extension("mpk")
    };
    if !file.exists() {
        return Err(RaterError::model_load(
            path,
            format!("MobileNetV2 weights not found: {}", file.display()),
        ));
    }

    tracing::info!("MobileNetV2 の重みを読み込みます: {}", file.display());

    if is_torchvision_file(path) {
        load_torchvision(path, device)
    } else {
        load_named_mpk(path, device)
    }
}

/// named MessagePack レコードとして保存（拡張子 .mpk はRecorderが付与する）
pub fn save_mobilenet_v2<B: Backend>(model: MobileNetV2<B>, path: &Path) -> Result<()> {
    model
        .save_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| RaterError::Persist {
            path: path.to_path_buf(),
            reason: format!("{:?}", e),
        })
}

/// torchvision の state dict を named MessagePack レコードに変換
///
/// # 戻り値
/// - パラメータ数
pub fn convert_torchvision_weights<B: Backend>(
    input: &Path,
    output: &Path,
    device: &B::Device,
) -> Result<usize> {
    if !is_torchvision_file(input) {
        return Err(RaterError::InvalidConfig(format!(
            "expected a .pth or .pt file: {}",
            input.display()
        )));
    }

    let model = load_mobilenet_v2::<B>(input, device)?;
    let num_params = model.num_params();
    save_mobilenet_v2(model, output)?;

    tracing::info!(
        "変換しました: {} -> {}.mpk ({} パラメータ)",
        input.display(),
        output.display(),
        num_params
    );
    Ok(num_params)
}

/// MobileNetV2 を使った特徴抽出器
pub struct MobileNetV2Extractor<B: Backend> {
    model: MobileNetV2<B>,
    device: B::Device,
}

impl<B: Backend> MobileNetV2Extractor<B> {
    /// 既存のモデルから作成
    pub fn new(model: MobileNetV2<B>, device: B::Device) -> Self {
        Self { model, device }
    }

    /// 重みファイルを読み込んで特徴抽出器を作成
    pub fn load(weights_path: &Path, device: &B::Device) -> Result<Self> {
        let model = load_mobilenet_v2::<B>(weights_path, device)?;
        Ok(Self::new(model, device.clone()))
    }
}

impl<B: Backend> FeatureExtractor for MobileNetV2Extractor<B> {
    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn infer(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        let [batch_size, height, width, channels] = image.shape();

        // グレースケールはRGBに複製
        let rgb: Vec<f32> = match channels {
            3 => image.data().to_vec(),
            1 => image.data().iter().flat_map(|&v| [v, v, v]).collect(),
            other => return Err(RaterError::UnsupportedChannels(other)),
        };

        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &self.device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &self.device).reshape([1, 3, 1, 1]);

        // NHWC -> NCHW、ImageNet 正規化
        let x = Tensor::<B, 1>::from_floats(rgb.as_slice(), &self.device)
            .reshape([batch_size, height, width, 3])
            .permute([0, 3, 1, 2]);
        let x = (x - mean) / std;

        let features = self.model.forward(x);

        features
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RaterError::Inference(format!("埋め込みの取得エラー: {:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use regex::Regex;

    type TestBackend = NdArray<f32>;

    fn write_image(dir: &Path, channels: usize) -> ImageTensor {
        let path = dir.join("img.png");
        image::RgbImage::from_pixel(32, 32, image::Rgb([120, 30, 200]))
            .save(&path)
            .unwrap();
        crate::ml::load_image_tensor(&path, 32, channels).unwrap()
    }

    fn remap(key: &str, remaps: &[(String, String)]) -> String {
        let mut name = key.to_string();
        for (pattern, replacement) in remaps {
            let re = Regex::new(pattern).unwrap();
            if re.is_match(&name) {
                name = re.replace_all(&name, replacement.as_str()).to_string();
            }
        }
        name
    }

    #[test]
    fn test_block_layout() {
        let device = Default::default();
        let model = MobileNetV2Config::new().init::<TestBackend>(&device);
        assert_eq!(model.blocks.len(), 17);
        assert_eq!(num_blocks(), 17);
        assert!(model.blocks[0].expand.is_none());
        assert!(model.blocks[1].expand.is_some());
    }

    #[test]
    fn test_torchvision_keys_map_to_fields() {
        let remaps = torchvision_key_remaps();
        let cases = [
            ("features.0.0.weight", "stem.conv.weight"),
            ("features.0.1.running_var", "stem.norm.running_var"),
            ("features.1.conv.0.0.weight", "blocks.0.depthwise.conv.weight"),
            ("features.1.conv.0.1.bias", "blocks.0.depthwise.norm.bias"),
            ("features.1.conv.1.weight", "blocks.0.project.conv.weight"),
            ("features.1.conv.2.running_mean", "blocks.0.project.norm.running_mean"),
            ("features.2.conv.0.0.weight", "blocks.1.expand.conv.weight"),
            ("features.10.conv.1.1.weight", "blocks.9.depthwise.norm.weight"),
            ("features.17.conv.2.weight", "blocks.16.project.conv.weight"),
            ("features.17.conv.3.running_mean", "blocks.16.project.norm.running_mean"),
            ("features.18.0.weight", "head.conv.weight"),
            ("features.18.1.bias", "head.norm.bias"),
            ("classifier.1.weight", "classifier.1.weight"),
        ];

        for (torchvision, expected) in cases {
            assert_eq!(remap(torchvision, &remaps), expected, "key {}", torchvision);
        }
    }

    #[test]
    fn test_embedding_length() {
        let device = Default::default();
        let model = MobileNetV2Config::new().init::<TestBackend>(&device);
        let extractor = MobileNetV2Extractor::new(model, device);

        let dir = tempfile::tempdir().unwrap();
        let embedding = extractor.infer(&write_image(dir.path(), 3)).unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!(embedding.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_grayscale_is_replicated_to_rgb() {
        let device = Default::default();
        let model = MobileNetV2Config::new().init::<TestBackend>(&device);
        let extractor = MobileNetV2Extractor::new(model, device);

        let dir = tempfile::tempdir().unwrap();
        let embedding = extractor.infer(&write_image(dir.path(), 1)).unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_saved_weights_reload_identically() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = MobileNetV2Config::new().init::<TestBackend>(&device);
        let weights = dir.path().join("mobilenet_v2");

        let original = MobileNetV2Extractor::new(model.clone(), device);
        save_mobilenet_v2(model, &weights).unwrap();
        assert!(weights.with_extension("mpk").exists());

        let reloaded = MobileNetV2Extractor::<TestBackend>::load(&weights, &device).unwrap();
        let image = write_image(dir.path(), 3);
        let a = original.infer(&image).unwrap();
        let b = reloaded.infer(&image).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        for name in ["mobilenet_v2", "mobilenet_v2.pth"] {
            let result = MobileNetV2Extractor::<TestBackend>::load(&dir.path().join(name), &device);
            assert!(matches!(result, Err(RaterError::ModelLoad { .. })));
        }
    }

    #[test]
    fn test_convert_rejects_non_torchvision_input() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let result = convert_torchvision_weights::<TestBackend>(
            &dir.path().join("weights.mpk"),
            &dir.path().join("out"),
            &device,
        );
        assert!(matches!(result, Err(RaterError::InvalidConfig(_))));
    }

    /// 実際の torchvision の重みで変換と再読み込みを確認する
    ///
    /// `MOBILENET_V2_PTH` に state dict のパスを指定して実行する。
    #[test]
    #[ignore = "requires torchvision mobilenet_v2 weights (MOBILENET_V2_PTH)"]
    fn test_convert_torchvision_weights() {
        let input = std::path::PathBuf::from(std::env::var("MOBILENET_V2_PTH").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("mobilenet_v2");
        let device = Default::default();

        let num_params = convert_torchvision_weights::<TestBackend>(&input, &output, &device).unwrap();
        assert!(num_params > 2_000_000);

        let image = write_image(dir.path(), 3);
        let direct = MobileNetV2Extractor::<TestBackend>::load(&input, &device).unwrap();
        let converted = MobileNetV2Extractor::<TestBackend>::load(&output, &device).unwrap();
        let a = direct.infer(&image).unwrap();
        let b = converted.infer(&image).unwrap();
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert_eq!(a, b);
    }
}
