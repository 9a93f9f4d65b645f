use std::{path::Path, process::ExitStatus};

#[derive(thiserror::Error, Debug)]
pub enum FfmpegError {
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("ffmpeg exited with {0}")]
    Failed(ExitStatus),
}

/// Combine a video and an audio file into `output` with stream copy, using
/// the ffmpeg binary at `program`. The result is written next to `output`
/// and only renamed into place when ffmpeg succeeds.
pub async fn remux(program: &Path, video: &Path, audio: &Path, output: &Path) -> Result<(), FfmpegError> {
    let mut temp = output.as_os_str().to_owned();
    temp.push(".part");

    let mut child = tokio::process::Command::new(program);

    child
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-stats")
        .arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio)
        .arg("-c")
        .arg("copy")
        .arg("-f")
        .arg("mp4")
        .arg(&temp);

    let status = child.spawn().map_err(FfmpegError::IoError)?.wait().await?;
    if !status.success() {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(FfmpegError::Failed(status));
    }

    tokio::fs::rename(&temp, output).await?;
    Ok(())
}
