use std::{
    io::{self, BufRead},
    thread,
};

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};
use face_capture::{
    config::CaptureConfig,
    flow::{FlowUpdate, UserInput},
};

fn main() -> Result<()> {
    env_logger::init();

    let config = CaptureConfig::from_env()?;
    let (input_tx, input_rx) = unbounded();
    let (update_tx, update_rx) = unbounded();

    spawn_stdin_reader(input_tx);
    thread::spawn(move || {
        for update in update_rx {
            if let FlowUpdate::State { state, prompt } = update {
                println!("[{state}] {}", prompt.text());
            }
        }
    });

    println!("type `begin` to start, press enter to take a photo, `quit` to cancel");
    run(&config, input_rx, update_tx)
}

fn spawn_stdin_reader(input_tx: Sender<UserInput>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let input = match line.trim() {
                "begin" | "b" => UserInput::Begin,
                "" | "tap" => UserInput::TapPreview,
                "quit" | "q" => UserInput::Cancel,
                other => {
                    eprintln!("unknown command: {other}");
                    continue;
                }
            };
            if input_tx.send(input).is_err() {
                break;
            }
        }
    });
}

#[cfg(feature = "camera-nokhwa")]
fn run(
    config: &CaptureConfig,
    input_rx: crossbeam_channel::Receiver<UserInput>,
    update_tx: Sender<FlowUpdate>,
) -> Result<()> {
    use face_capture::{
        flow::{FlowParts, run_capture_flow},
        pipeline::{
            PreviewSlot,
            analyzer::load_onnx_analyzers,
            nokhwa_backend::{NokhwaCamera, NokhwaPermission, available_cameras},
        },
        publisher::{Completion, store_for},
    };
    use nokhwa::utils::CameraIndex;
    use std::sync::Arc;

    let index = match available_cameras() {
        Ok(devices) => {
            for device in &devices {
                log::info!("found camera {:?}: {}", device.index, device.label);
            }
            devices
                .into_iter()
                .nth(config.camera_index as usize)
                .map(|device| device.index)
                .unwrap_or(CameraIndex::Index(config.camera_index))
        }
        Err(err) => {
            log::warn!("camera enumeration failed: {err:?}");
            CameraIndex::Index(config.camera_index)
        }
    };

    let (face, segmenter) = load_onnx_analyzers(config)?;
    let parts = FlowParts {
        camera: Arc::new(NokhwaCamera::new(index, config.mirror_preview)),
        permission: Box::new(NokhwaPermission),
        face,
        segmenter,
        store: store_for(&config.upload, &config.user_id),
        preview: PreviewSlot::new(),
    };

    let (result_tx, result_rx) = unbounded();
    let completion = Completion::new(move |result| {
        let _ = result_tx.send(result);
    });
    let state = run_capture_flow(parts, config, input_rx, update_tx, completion);

    match result_rx.try_recv() {
        Ok(Ok(())) => {
            println!("photos saved ({state})");
            Ok(())
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow::anyhow!("capture ended without a result")),
    }
}

#[cfg(not(feature = "camera-nokhwa"))]
fn run(
    _config: &CaptureConfig,
    _input_rx: crossbeam_channel::Receiver<UserInput>,
    _update_tx: Sender<FlowUpdate>,
) -> Result<()> {
    anyhow::bail!("face-capture was built without camera support; enable the `camera-nokhwa` feature")
}
