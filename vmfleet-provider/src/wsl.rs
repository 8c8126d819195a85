//! Windows Subsystem for Linux path translation.
//!
//! Under WSL the VirtualBox tools are Windows binaries and need Windows-style
//! paths. WSL is detected by the presence of `wslpath` on `PATH`.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec::run_program;

const WSLPATH: &str = "wslpath";

/// Locate `program` on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Whether the current host is a WSL environment.
pub fn is_wsl() -> bool {
    find_in_path(WSLPATH).is_some()
}

/// Converts local paths to the form expected by host-side tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTranslator {
    windows: bool,
}

impl PathTranslator {
    /// Translator that converts paths when running under WSL.
    pub fn detect() -> Self {
        Self { windows: is_wsl() }
    }

    /// Translator that leaves paths untouched.
    pub fn native() -> Self {
        Self { windows: false }
    }

    pub fn is_windows(&self) -> bool {
        self.windows
    }

    /// Path in host-tool form.
    pub async fn translate(&self, path: &Path) -> Result<String> {
        if !self.windows {
            return Ok(path.display().to_string());
        }
        let arg = path.display().to_string();
        let output = run_program(WSLPATH, &["-w", &arg]).await?;
        Ok(output.trim().to_string())
    }

    /// Join `file` onto a directory already in host-tool form.
    pub fn join(&self, translated_dir: &str, file: &str) -> String {
        let separator = if self.windows { '\\' } else { '/' };
        format!("{}{}{}", translated_dir.trim_end_matches(separator), separator, file)
    }
}
