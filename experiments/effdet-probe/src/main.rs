use base::{Frame, log};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use effdet::{Inference, ModelConfig, PostMode, PreMode, inference::build_model};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;

fn load_config(arg: &str) -> Result<ModelConfig, effdet::EffDetError> {
    if Path::new(arg).extension().is_some_and(|ext| ext == "json") {
        ModelConfig::from_json_file(arg)
    } else {
        ModelConfig::preset(arg)
    }
}

/// Gray frame with a bright square in the middle.
fn test_frame(width: usize, height: usize) -> Result<Frame, base::FrameError> {
    let mut data = vec![96u8; width * height * Frame::CHANNELS];
    for y in height / 4..height * 3 / 4 {
        for x in width / 4..width * 3 / 4 {
            let i = (y * width + x) * Frame::CHANNELS;
            data[i..i + Frame::CHANNELS].copy_from_slice(&[240, 220, 40]);
        }
    }
    Frame::new(width, height, data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // EFFDET_LOG_DIR sends logs to day files instead of stdout
    match std::env::var("EFFDET_LOG_DIR") {
        Ok(dir) => base::init_file_logger(dir)?,
        Err(_) => base::init_stdout_logger(),
    }

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <preset|config.json> [weights.safetensors] [overrides-json]", args[0]);
        std::process::exit(1);
    }

    let mut config = load_config(&args[1])?;
    if let Some(overrides) = args.get(3) {
        config = config.with_overrides(overrides)?;
    }
    log::info!(
        "{}: {}x{} input, levels {}..={}, {} anchors per location",
        config.name,
        config.image_size.0,
        config.image_size.1,
        config.min_level,
        config.max_level,
        config.num_anchors()
    );

    let inference = Inference::cpu();
    let device = inference.device().clone();

    let model = match args.get(2) {
        Some(weights) if weights != "-" => inference.load_efficientdet(weights, &config)?,
        _ => {
            log::warn!("no weights given, using random initialization");
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            build_model(vb, &config)?
        }
    };

    let (h, w) = config.image_size;
    let images = Tensor::zeros((1, 3, h, w), DType::F32, &device)?;
    let outputs = model.forward(&images, false, PreMode::None, PostMode::None)?;
    if let Some(detection) = &outputs.net.detection {
        for (i, (class, boxes)) in detection.class_outputs.iter().zip(&detection.box_outputs).enumerate() {
            log::info!(
                "level {}: class {:?} box {:?}",
                config.min_level + i,
                class.dims(),
                boxes.dims()
            );
        }
    }
    if let Some(seg) = &outputs.net.segmentation {
        log::info!("segmentation {:?}", seg.dims());
    }

    let mut detector = effdet::Detector::new(model, device);
    for (width, height) in [(640, 480), (w, h)] {
        detector.send(test_frame(width, height)?).await?;
    }
    detector.close().await?;

    let mut index = 0;
    while let Some(result) = detector.next().await {
        let detections = result?;
        log::info!("frame {index}: {} detections", detections.len());
        for d in detections.iter().take(5) {
            log::info!(
                "  class {} score {:.3} box [{:.1}, {:.1}, {:.1}, {:.1}]",
                d.class_id,
                d.score,
                d.bbox[0],
                d.bbox[1],
                d.bbox[2],
                d.bbox[3]
            );
        }
        index += 1;
    }

    Ok(())
}
