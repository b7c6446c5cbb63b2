//! Script-to-bytecode compilers for scripts embedded in 1.x images.

use std::future::Future;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use super::FirmwareError;

/// Compiles MicroPython source to `.mpy` bytecode.
pub trait ScriptCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        abi_version: u32,
        options: &[String],
    ) -> impl Future<Output = Result<Vec<u8>, FirmwareError>> + Send;
}

/// Runs the external `mpy-cross` tool.
#[derive(Debug, Clone)]
pub struct MpyCross {
    program: PathBuf,
}

impl Default for MpyCross {
    fn default() -> Self {
        Self::new("mpy-cross")
    }
}

impl MpyCross {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Bytecode version the installed tool emits, from `--version`.
    pub async fn abi_version(&self) -> Result<u32, FirmwareError> {
        let output = Command::new(&self.program).arg("--version").output().await?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_abi_version(&text).ok_or_else(|| {
            FirmwareError::Compile(format!("unrecognized mpy-cross version: {}", text.trim()))
        })
    }
}

fn parse_abi_version(text: &str) -> Option<u32> {
    let (_, rest) = text.split_once("mpy v")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl ScriptCompiler for MpyCross {
    async fn compile(
        &self,
        source: &str,
        abi_version: u32,
        options: &[String],
    ) -> Result<Vec<u8>, FirmwareError> {
        let found = self.abi_version().await?;
        if found != abi_version {
            return Err(FirmwareError::Compile(format!(
                "firmware needs mpy v{}, {} emits v{}",
                abi_version,
                self.program.display(),
                found
            )));
        }

        let dir = tempfile::tempdir()?;
        let input = dir.path().join("main.py");
        let output = dir.path().join("main.mpy");
        tokio::fs::write(&input, source).await?;

        debug!(program = %self.program.display(), ?options, "Compiling script");
        let result = Command::new(&self.program)
            .current_dir(dir.path())
            .args(options)
            .arg("-o")
            .arg(&output)
            .arg("main.py")
            .output()
            .await?;
        if !result.status.success() {
            return Err(FirmwareError::Compile(
                String::from_utf8_lossy(&result.stderr).trim().to_string(),
            ));
        }
        Ok(tokio::fs::read(&output).await?)
    }
}

/// Hands back bytecode compiled ahead of time.
#[derive(Debug, Clone, Default)]
pub struct Precompiled(pub Vec<u8>);

impl ScriptCompiler for Precompiled {
    async fn compile(
        &self,
        _source: &str,
        _abi_version: u32,
        _options: &[String],
    ) -> Result<Vec<u8>, FirmwareError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_abi_version() {
        assert_eq!(
            parse_abi_version("MicroPython v1.20.0 on 2023-04-26; mpy-cross emitting mpy v6.1"),
            Some(6)
        );
        assert_eq!(parse_abi_version("mpy-cross emitting mpy v5"), Some(5));
        assert_eq!(parse_abi_version("something else"), None);
    }

    #[tokio::test]
    async fn test_missing_tool_is_an_error() {
        let compiler = MpyCross::new("/nonexistent/mpy-cross");
        assert!(compiler.compile("print(1)", 6, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_precompiled_passthrough() {
        let compiler = Precompiled(b"M\x06".to_vec());
        assert_eq!(compiler.compile("ignored", 6, &[]).await.unwrap(), b"M\x06");
    }
}
