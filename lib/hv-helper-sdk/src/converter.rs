use std::os::fd::RawFd;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterWidth {
    W32,
    W64,
}

impl ConverterWidth {
    fn as_arg(self) -> &'static str {
        match self {
            ConverterWidth::W32 => "32",
            ConverterWidth::W64 => "64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterGuest {
    Hvm,
    Pv,
}

impl ConverterGuest {
    fn as_arg(self) -> &'static str {
        match self {
            ConverterGuest::Hvm => "hvm",
            ConverterGuest::Pv => "pv",
        }
    }
}

/// Spawns the legacy-stream converter callout, which reads a pre-v2
/// stream on one fd and writes a migration-v2 stream on another.
/// Argument construction mirrors `convert_legacy_stream` in
/// `libxl_convert_callout.c`.
pub struct LegacyConverter {
    process: Child,
}

impl LegacyConverter {
    pub fn spawn(
        converter_binary: &str,
        in_fd: RawFd,
        out_fd: RawFd,
        width: ConverterWidth,
        guest: ConverterGuest,
    ) -> Result<Self, Error> {
        let process = Command::new(converter_binary)
            .arg("--in")
            .arg(in_fd.to_string())
            .arg("--out")
            .arg(out_fd.to_string())
            .arg("--width")
            .arg(width.as_arg())
            .arg("--guest")
            .arg(guest.as_arg())
            .arg("--format")
            .arg("libxl")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        Ok(LegacyConverter { process })
    }

    /// Join the converter, returning once it has exited. Called at
    /// reader-side teardown so the converter's own fds are fully closed
    /// before the session tears down its pipes.
    pub async fn join(&mut self) -> Result<std::process::ExitStatus, Error> {
        self.process.wait().await.map_err(Error::Process)
    }
}

impl Drop for LegacyConverter {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
    }
}
