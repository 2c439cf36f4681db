//! ffmpeg decoder process
//!
//! Decodes any container/codec ffmpeg understands into raw interleaved PCM
//! on the process's stdout. Callers read it in block-sized chunks.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use super::probe::StreamInfo;
use crate::config::DecoderConfig;
use crate::error::DecodeError;

/// Raw PCM sample format requested from ffmpeg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32Le,
    S16Le,
}

impl SampleFormat {
    pub fn container(&self) -> &'static str {
        match self {
            SampleFormat::F32Le => "f32le",
            SampleFormat::S16Le => "s16le",
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            SampleFormat::F32Le => "pcm_f32le",
            SampleFormat::S16Le => "pcm_s16le",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32Le => 4,
            SampleFormat::S16Le => 2,
        }
    }
}

/// ffmpeg arguments decoding `path` to raw PCM on stdout
pub fn decode_args(path: &Path, info: &StreamInfo, format: SampleFormat) -> Vec<String> {
    vec![
        "-loglevel".to_string(),
        "quiet".to_string(),
        "-i".to_string(),
        path.display().to_string(),
        "-f".to_string(),
        format.container().to_string(),
        "-acodec".to_string(),
        format.codec().to_string(),
        "-ac".to_string(),
        info.channels.to_string(),
        "-ar".to_string(),
        info.sample_rate.to_string(),
        "pipe:1".to_string(),
    ]
}

/// Running decoder; reading yields raw PCM until the process exits
pub struct FfmpegDecoder {
    program: String,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl FfmpegDecoder {
    pub fn spawn(
        config: &DecoderConfig,
        path: &Path,
        info: &StreamInfo,
        format: SampleFormat,
    ) -> Result<Self, DecodeError> {
        let mut command = Command::new(&config.ffmpeg);
        command.args(decode_args(path, info, format));
        tracing::debug!("Decoding {} with {}", path.display(), config.ffmpeg);
        Self::from_command(command, &config.ffmpeg)
    }

    fn from_command(mut command: Command, program: &str) -> Result<Self, DecodeError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| DecodeError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecodeError::ProcessFailed(format!("{}: no stdout", program)))?;

        Ok(Self {
            program: program.to_string(),
            child,
            stdout,
            finished: false,
        })
    }
}

impl Read for FfmpegDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    DecodeError::ProcessFailed(format!("{} exited with {}", self.program, status)),
                ));
            }
        }
        Ok(n)
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
