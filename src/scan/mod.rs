pub mod actor;
pub mod camera;
pub mod prepare;
pub mod qr;
pub mod rectify;

use std::fs;

use image::RgbImage;
use serde_json::{json, Value};

use crate::command_log::CommandLogger;
use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::geometry::Rect;
use crate::reindex;
use crate::scan::qr::QrPayload;

/// Predicate deciding whether an error should abort the attempt without
/// being logged (used by long-running capture loops to drop boring
/// frames).
pub type ShouldSkip<'a> = Option<&'a dyn Fn(&ScanariumError) -> bool>;

fn switch_scene(scanarium: &Scanarium, scene: &str) -> Result<Value> {
    let scene_dir = scanarium.scenes_dir_abs()?.join(scene);
    if !scene_dir.is_dir() {
        return Err(ScanariumError::with_parameters(
            ErrorKind::UnknownScene,
            "Scene \"{scene_name}\" does not exist",
            &[("scene_name", scene)],
        ));
    }

    // Updating the default scene is opportunistic: clients can switch on
    // their own even when the global config cannot be written, so a
    // failure here is only worth a log line for the admins.
    let result: Result<()> = (|| {
        let json_file = scanarium.dynamic_dir_abs()?.join("config.json");
        let mut config: Value = fs::read_to_string(&json_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| json!({}));
        config["default_scene"] = json!(scene);
        scanarium.dump_json(&json_file, &config)
    })();
    if let Err(error) = result {
        log::error!("failed to update default scene: {error}");
    }

    Ok(json!({}))
}

/// Drop all scanned actor artifacts and rebuild the (now empty) listings.
fn reset_dynamic_content(scanarium: &Scanarium) -> Result<Value> {
    let dynamic_scenes = scanarium.dynamic_dir_abs()?.join("scenes");
    if let Ok(scenes) = fs::read_dir(&dynamic_scenes) {
        for scene in scenes.filter_map(|entry| entry.ok()) {
            let actors_dir = scene.path().join("actors");
            if actors_dir.is_dir() {
                let _ = fs::remove_dir_all(&actors_dir);
            }
            if let Some(scene_name) = scene.file_name().to_str() {
                reindex::reindex_actors_for_scene(scanarium, scene_name)?;
            }
        }
    }
    Ok(json!({}))
}

fn process_image_with_qr_code_unlogged(
    scanarium: &Scanarium,
    payload: &QrPayload,
    image: &RgbImage,
    qr_rect: &Rect,
) -> Result<Value> {
    match payload.command.as_str() {
        "debug" => match payload.parameter.as_str() {
            "ok" => Ok(json!({ "ok": true })),
            "fail" => Err(ScanariumError::new(
                ErrorKind::DebugFail,
                "Intentional error from the \"debug:fail\" command",
            )),
            "toggleFps" | "toggleDevInfo" => Ok(json!({})),
            _ => Err(ScanariumError::with_parameters(
                ErrorKind::UnknownParam,
                "Command \"{command}\" does not allow a parameter \"{parameter}\"",
                &[
                    ("command", &payload.command),
                    ("parameter", &payload.parameter),
                ],
            )),
        },
        "reset" => reset_dynamic_content(scanarium),
        "switchScene" => switch_scene(scanarium, &payload.parameter),
        _ => actor::process_actor_image_with_qr_code(scanarium, image, qr_rect, payload),
    }
}

/// Guarded processing of a decoded frame: parse the payload, dispatch,
/// and funnel the outcome through the command log. Only a skip-predicate
/// hit escapes without a log record.
pub fn process_image_with_qr_code(
    scanarium: &Scanarium,
    command_logger: &CommandLogger,
    image: &RgbImage,
    qr_rect: &Rect,
    data: &str,
    should_skip: ShouldSkip,
) -> Result<Value> {
    let mut command = None;
    let mut parameter = None;

    let outcome = qr::parse_qr(scanarium, data).and_then(|payload| {
        command = Some(payload.command.clone());
        parameter = Some(payload.parameter.clone());
        process_image_with_qr_code_unlogged(scanarium, &payload, image, qr_rect)
    });

    match outcome {
        Ok(payload) => command_logger.log(
            Some(payload),
            None,
            command.as_deref(),
            vec![parameter],
        ),
        Err(error) => {
            if let Some(should_skip) = should_skip {
                if should_skip(&error) {
                    return Err(ScanariumError::new(
                        ErrorKind::SkippedException,
                        "Exception marked as skipped",
                    ));
                }
            }
            command_logger.log(None, Some(&error), command.as_deref(), vec![parameter])
        }
    }
}

/// One full scan attempt against the configured source. Acquisition and
/// detection failures are funneled through the same log as processing
/// failures, so every attempt leaves exactly one record.
pub fn scan_once(
    scanarium: &Scanarium,
    command_logger: &CommandLogger,
    visualized_alpha: Option<f32>,
) -> Result<Value> {
    let acquired = camera::get_image(scanarium, None).and_then(|image| {
        let (qr_rect, data) = qr::extract_qr(scanarium, &image)?;
        Ok((image, qr_rect, data))
    });

    match acquired {
        Err(error) => command_logger.log(None, Some(&error), None, vec![None]),
        Ok((image, qr_rect, data)) => {
            if let Some(alpha) = visualized_alpha {
                // Visualization bypasses dispatch: run the actor pipeline
                // and report the artifact dimensions without persisting.
                let mut command = None;
                let mut parameter = None;
                let outcome = qr::parse_qr(scanarium, &data).and_then(|payload| {
                    command = Some(payload.command.clone());
                    parameter = Some(payload.parameter.clone());
                    let visualized = actor::actor_image_pipeline(
                        scanarium,
                        &image,
                        &qr_rect,
                        &payload,
                        Some(alpha),
                    )?;
                    Ok(json!({
                        "width": visualized.width(),
                        "height": visualized.height(),
                    }))
                });
                match outcome {
                    Ok(payload) => {
                        command_logger.log(Some(payload), None, command.as_deref(), vec![parameter])
                    }
                    Err(error) => {
                        command_logger.log(None, Some(&error), command.as_deref(), vec![parameter])
                    }
                }
            } else {
                process_image_with_qr_code(
                    scanarium,
                    command_logger,
                    &image,
                    &qr_rect,
                    &data,
                    None,
                )
            }
        }
    }
}
