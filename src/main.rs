use anyhow::{Context, Result};
use hotkey_asr::audio;
use hotkey_asr::config::Config;
use hotkey_asr::telemetry;
use hotkey_asr::transcription::{Progress, ProgressFn, Recognizer, WorkerSupervisor};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    println!("✓ Config loaded from ~/.hotkey-asr.toml");

    telemetry::init(&config.telemetry)?;
    tracing::info!(mode = ?config.worker.mode, "hotkey-asr starting");

    let launcher = config.worker.launcher()?;
    let supervisor = WorkerSupervisor::with_child_spawner(
        Arc::new(launcher),
        config.worker.mode,
        config.worker.supervisor_settings(),
    );
    let recognizer = Recognizer::new(supervisor, config.worker.request_timeouts());

    let wav_paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();

    tokio::select! {
        result = run(&recognizer, &config, &wav_paths) => {
            recognizer.dispose().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            println!("\nShutting down...");
            recognizer.dispose().await;
            Ok(())
        }
    }
}

async fn run(recognizer: &Recognizer, config: &Config, wav_paths: &[PathBuf]) -> Result<()> {
    let status = recognizer
        .check_status(&config.model)
        .await
        .context("failed to check model status")?;
    for dependency in &status.dependencies {
        tracing::info!(
            role = %dependency.role,
            model = %dependency.model_name,
            complete = dependency.complete,
            missing = dependency.missing_files.len(),
            "model dependency"
        );
    }
    if !status.downloaded {
        println!("Models not fully downloaded; initialization will fetch them");
    }

    let on_progress: ProgressFn = Arc::new(|progress: &Progress| {
        tracing::info!(
            percent = progress.percent,
            status = progress.status.as_deref().unwrap_or_default(),
            "model loading"
        );
    });
    recognizer
        .initialize(&config.model, Some(on_progress))
        .await
        .context("failed to initialize recognizer")?;
    println!("✓ Model loaded: {}", config.model.asr.model_name);

    for path in wav_paths {
        let wav = audio::load_for_worker(path)?;
        let result = recognizer
            .recognize_wav(&wav)
            .await
            .with_context(|| format!("failed to recognize {}", path.display()))?;
        println!("{}: {}", path.display(), result.text);
    }

    Ok(())
}
