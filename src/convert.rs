//! External converter invocation.
//!
//! Each operation shells out to a native tool (Ghostscript, LibreOffice,
//! ImageMagick, Tesseract, zip) inside a per-attempt scratch directory.
//! A non-zero exit is a hard failure of the attempt; there is no retry
//! below this layer. Output artifacts carry deterministic names derived
//! from the job id, so they are located by construction, never by
//! globbing shared space.

use crate::job::{ConvertJob, Operation};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("{tool} exited with {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: String,
        stderr: String,
    },
    #[error("failed to launch {tool}: {source}")]
    ToolUnavailable {
        tool: String,
        source: std::io::Error,
    },
    #[error("expected output missing or empty: {0}")]
    MissingOutput(PathBuf),
    #[error("operation requires at least one input")]
    NoInput,
    #[error("invalid page ranges {spec:?}: {reason}")]
    InvalidRanges { spec: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Conversion seam between the worker and the native tools.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Convert: Send + Sync {
    /// Converts staged `inputs` per the job's operation, writing into
    /// `scratch`, and returns the path of the produced artifact.
    async fn convert(
        &self,
        job: &ConvertJob,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf, ConvertError>;
}

/// Converter backed by the external native toolchain.
pub struct ToolConverter;

impl ToolConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ToolConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Convert for ToolConverter {
    async fn convert(
        &self,
        job: &ConvertJob,
        inputs: &[PathBuf],
        scratch: &Path,
    ) -> Result<PathBuf, ConvertError> {
        let output = match job.operation {
            Operation::Merge => merge(&job.job_id, inputs, scratch).await?,
            Operation::Compress => compress(&job.job_id, single(inputs)?, scratch).await?,
            Operation::Split => {
                split(
                    &job.job_id,
                    single(inputs)?,
                    job.options.ranges.as_deref(),
                    scratch,
                )
                .await?
            }
            Operation::WordToPdf => office_convert(single(inputs)?, "pdf", scratch).await?,
            Operation::PdfToWord => office_convert(single(inputs)?, "docx", scratch).await?,
            Operation::Ocr => ocr(&job.job_id, single(inputs)?, scratch).await?,
            Operation::Flatten => flatten(&job.job_id, single(inputs)?, scratch).await?,
        };

        let size = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(ConvertError::MissingOutput(output));
        }

        info!(
            job_id = %job.job_id,
            operation = %job.operation,
            output = %output.display(),
            bytes = size,
            "Conversion complete"
        );
        Ok(output)
    }
}

fn single(inputs: &[PathBuf]) -> Result<&Path, ConvertError> {
    inputs.first().map(PathBuf::as_path).ok_or(ConvertError::NoInput)
}

/// Concatenates the inputs, in order, into one PDF.
async fn merge(job_id: &str, inputs: &[PathBuf], scratch: &Path) -> Result<PathBuf, ConvertError> {
    if inputs.is_empty() {
        return Err(ConvertError::NoInput);
    }
    let out = scratch.join(format!("{job_id}-merge.pdf"));
    run("gs", &merge_args(&out, inputs)).await?;
    Ok(out)
}

/// Ghostscript argument list for a merge; trailing input paths keep
/// submission order, which fixes the page order of the output.
fn merge_args(out: &Path, inputs: &[PathBuf]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-dBATCH".into(),
        "-dNOPAUSE".into(),
        "-q".into(),
        "-sDEVICE=pdfwrite".into(),
        format!("-sOutputFile={}", out.display()),
    ];
    args.extend(inputs.iter().map(|p| p.display().to_string()));
    args
}

/// Re-encodes a single PDF at ebook quality.
async fn compress(job_id: &str, input: &Path, scratch: &Path) -> Result<PathBuf, ConvertError> {
    let out = scratch.join(format!("{job_id}-compress.pdf"));
    run(
        "gs",
        &[
            "-dBATCH".into(),
            "-dNOPAUSE".into(),
            "-q".into(),
            "-sDEVICE=pdfwrite".into(),
            "-dPDFSETTINGS=/ebook".into(),
            format!("-sOutputFile={}", out.display()),
            input.display().to_string(),
        ],
    )
    .await?;
    Ok(out)
}

/// Explodes a PDF into per-range PDFs and bundles them as a zip.
///
/// With no range spec every page becomes its own file. Range upper
/// bounds are clamped to the document's page count.
async fn split(
    job_id: &str,
    input: &Path,
    ranges: Option<&str>,
    scratch: &Path,
) -> Result<PathBuf, ConvertError> {
    let pages = pdf_page_count(input).await?;
    let ranges = parse_page_ranges(ranges, pages)?;

    let mut parts = Vec::with_capacity(ranges.len());
    for (idx, (first, last)) in ranges.iter().enumerate() {
        let part = scratch.join(format!("{job_id}-part-{:03}.pdf", idx + 1));
        run(
            "gs",
            &[
                "-dBATCH".into(),
                "-dNOPAUSE".into(),
                "-q".into(),
                "-sDEVICE=pdfwrite".into(),
                format!("-dFirstPage={first}"),
                format!("-dLastPage={last}"),
                format!("-sOutputFile={}", part.display()),
                input.display().to_string(),
            ],
        )
        .await?;
        parts.push(part);
    }

    let out = scratch.join(format!("{job_id}-split.zip"));
    let mut args: Vec<String> = vec!["-j".into(), out.display().to_string()];
    args.extend(parts.iter().map(|p| p.display().to_string()));
    run("zip", &args).await?;
    Ok(out)
}

/// Converts via the LibreOffice headless renderer.
///
/// soffice names its output after the input's stem, so the result path
/// is known without listing the directory.
async fn office_convert(
    input: &Path,
    target_ext: &str,
    scratch: &Path,
) -> Result<PathBuf, ConvertError> {
    run(
        "soffice",
        &[
            "--headless".into(),
            "--convert-to".into(),
            target_ext.to_string(),
            "--outdir".into(),
            scratch.display().to_string(),
            input.display().to_string(),
        ],
    )
    .await?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ConvertError::MissingOutput(input.to_path_buf()))?;
    Ok(scratch.join(format!("{stem}.{target_ext}")))
}

/// Rasterizes each page, recognizes text, and emits a searchable PDF
/// with an invisible text layer over the original raster.
async fn ocr(job_id: &str, input: &Path, scratch: &Path) -> Result<PathBuf, ConvertError> {
    let page_template = scratch.join(format!("{job_id}-page-%04d.png"));
    run(
        "magick",
        &[
            "-density".into(),
            "300".into(),
            input.display().to_string(),
            page_template.display().to_string(),
        ],
    )
    .await?;

    // Collect the rendered pages in order; the prefix is job-scoped and
    // the scratch dir is private to this attempt.
    let prefix = format!("{job_id}-page-");
    let mut pages = Vec::new();
    let mut entries = tokio::fs::read_dir(scratch).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".png") {
            pages.push(entry.path());
        }
    }
    pages.sort();
    if pages.is_empty() {
        return Err(ConvertError::MissingOutput(
            scratch.join(format!("{prefix}0000.png")),
        ));
    }

    let manifest = scratch.join(format!("{job_id}-pages.txt"));
    let listing = pages
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(&manifest, listing).await?;

    let out_base = scratch.join(format!("{job_id}-ocr"));
    run(
        "tesseract",
        &[
            manifest.display().to_string(),
            out_base.display().to_string(),
            "pdf".into(),
        ],
    )
    .await?;
    Ok(scratch.join(format!("{job_id}-ocr.pdf")))
}

/// Normalizes a PDF's structure (prepress settings, duplicate image
/// detection).
async fn flatten(job_id: &str, input: &Path, scratch: &Path) -> Result<PathBuf, ConvertError> {
    let out = scratch.join(format!("{job_id}-flatten.pdf"));
    run(
        "gs",
        &[
            "-o".into(),
            out.display().to_string(),
            "-sDEVICE=pdfwrite".into(),
            "-dPDFSETTINGS=/prepress".into(),
            "-dDetectDuplicateImages=true".into(),
            input.display().to_string(),
        ],
    )
    .await?;
    Ok(out)
}

/// Reads the page count of a PDF via Ghostscript.
async fn pdf_page_count(input: &Path) -> Result<u32, ConvertError> {
    let script = format!(
        "({}) (r) file runpdfbegin pdfpagecount = quit",
        input.display()
    );
    let stdout = run_capture(
        "gs",
        &[
            "-q".into(),
            "-dNODISPLAY".into(),
            "-dNOSAFER".into(),
            "-c".into(),
            script,
        ],
    )
    .await?;
    stdout
        .trim()
        .parse()
        .map_err(|_| ConvertError::MissingOutput(input.to_path_buf()))
}

/// Parses a page-range spec like `"1-3,5"` against a known page count.
///
/// Pages are 1-based. Upper bounds beyond the document clamp to the
/// last page; a range lying entirely past the end is dropped. `None`
/// yields one single-page range per page.
pub fn parse_page_ranges(
    spec: Option<&str>,
    page_count: u32,
) -> Result<Vec<(u32, u32)>, ConvertError> {
    let Some(spec) = spec else {
        return Ok((1..=page_count).map(|p| (p, p)).collect());
    };

    let invalid = |reason: &str| ConvertError::InvalidRanges {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let mut ranges = Vec::new();
    for segment in spec.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        let (first, last) = match segment.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid("not a number"))?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid("not a number"))?;
                (lo, hi)
            }
            None => {
                let page: u32 = segment.parse().map_err(|_| invalid("not a number"))?;
                (page, page)
            }
        };
        if first == 0 {
            return Err(invalid("pages are 1-based"));
        }
        if first > last {
            return Err(invalid("descending range"));
        }
        if first > page_count {
            continue;
        }
        ranges.push((first, last.min(page_count)));
    }

    if ranges.is_empty() {
        return Err(invalid("no pages selected"));
    }
    Ok(ranges)
}

async fn run(tool: &str, args: &[String]) -> Result<(), ConvertError> {
    run_capture(tool, args).await.map(|_| ())
}

async fn run_capture(tool: &str, args: &[String]) -> Result<String, ConvertError> {
    debug!(tool = tool, args = ?args, "Invoking external tool");

    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ConvertError::ToolUnavailable {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ConvertError::ToolFailed {
            tool: tool.to_string(),
            code,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
