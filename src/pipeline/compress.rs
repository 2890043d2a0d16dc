//! Lossy PDF recompression.
//!
//! The production compressor shells out to Ghostscript's `pdfwrite` device.
//! Ghostscript announces the page range once (`Processing pages 1 through
//! 12.`) and then prints `Page N` as it starts each page; [`CompressProgress`]
//! turns that stream into a monotone 0–100 percentage.

use crate::config::DeliveryConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

/// Suffix the compressor output carries until it is renamed.
pub const COMPRESSED_SUFFIX: &str = "_compressed";

/// Receives each line the compressor prints.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Rewrites `input` into a smaller `output`.
#[async_trait]
pub trait PdfCompressor: Send + Sync {
    async fn compress(&self, input: &Path, output: &Path, on_line: LineSink<'_>) -> Result<(), ToolError>;
}

/// Ghostscript `pdfwrite` subprocess.
#[derive(Debug, Clone)]
pub struct GhostscriptCompressor {
    program: String,
    compatibility_level: String,
    quality_preset: String,
}

impl GhostscriptCompressor {
    pub fn new(
        program: impl Into<String>,
        compatibility_level: impl Into<String>,
        quality_preset: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            compatibility_level: compatibility_level.into(),
            quality_preset: quality_preset.into(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            &config.ghostscript_bin,
            &config.pdf_compatibility_level,
            &config.pdf_quality_preset,
        )
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-sDEVICE=pdfwrite".to_string(),
            format!("-dCompatibilityLevel={}", self.compatibility_level),
            format!("-dPDFSETTINGS={}", self.quality_preset),
            "-dNOPAUSE".to_string(),
            "-dBATCH".to_string(),
            format!("-sOutputFile={}", output.display()),
            input.display().to_string(),
        ]
    }
}

#[async_trait]
impl PdfCompressor for GhostscriptCompressor {
    async fn compress(&self, input: &Path, output: &Path, on_line: LineSink<'_>) -> Result<(), ToolError> {
        let args = self.args(input, output);
        debug!("{} {}", self.program, args.join(" "));

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drain stderr concurrently so a chatty tool cannot block on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                on_line(&line);
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(ToolError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

static RE_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Processing pages (\d+) through (\d+)\.").unwrap());
static RE_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Page (\d+)\b").unwrap());

/// Page-progress parser for Ghostscript output.
#[derive(Debug, Default, Clone)]
pub struct CompressProgress {
    range: Option<(u32, u32)>,
    percent: u8,
}

impl CompressProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line. Returns the new percentage when it advanced.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();
        if let Some(c) = RE_RANGE.captures(line) {
            let first: u32 = c[1].parse().ok()?;
            let last: u32 = c[2].parse().ok()?;
            if last >= first {
                self.range = Some((first, last));
            }
            return None;
        }

        let page: u32 = RE_PAGE.captures(line)?[1].parse().ok()?;
        let (first, last) = self.range?;
        let total = u64::from(last - first + 1);
        let done = u64::from(page.saturating_sub(first) + 1).min(total);
        let pct = (done * 100 / total) as u8;
        if pct > self.percent {
            self.percent = pct;
            Some(pct)
        } else {
            None
        }
    }

    /// Mark the run complete; progress is pinned to 100.
    pub fn finish(&mut self) -> u8 {
        self.percent = 100;
        self.percent
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

/// `name_compressed.pdf` for an input `name.pdf`.
pub fn compressed_name_for(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}{COMPRESSED_SUFFIX}.pdf")
}

/// File name with the compression suffix removed, if it carries one.
pub fn strip_compressed_suffix(file_name: &str) -> Option<String> {
    let path = Path::new(file_name);
    let stem = path.file_stem()?.to_string_lossy();
    let base = stem.strip_suffix(COMPRESSED_SUFFIX)?;
    match path.extension() {
        Some(ext) => Some(format!("{base}.{}", ext.to_string_lossy())),
        None => Some(base.to_string()),
    }
}
