use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use regex::Regex;

/// Placeholder replaced by the carved file name in external commands.
pub const FILE_PLACEHOLDER: &str = "%e";

/// What an extraction rule runs against a carved file.
#[derive(Clone)]
pub enum ExtractCommand {
    /// In-process routine, called with the carved file path.
    Builtin(Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>),
    /// Program and arguments, split on whitespace. The program runs in the
    /// carved file's directory and every `%e` is replaced by the carved file
    /// name. No shell is involved.
    External(String),
}

impl ExtractCommand {
    pub fn builtin<F>(f: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ExtractCommand::Builtin(Arc::new(f))
    }

    /// Run the command against `file`.
    pub fn run(&self, file: &Path) -> anyhow::Result<()> {
        match self {
            ExtractCommand::Builtin(f) => f(file),
            ExtractCommand::External(cmdline) => {
                // The command runs inside the carved file's directory, so `%e`
                // must name the file relative to it.
                let (workdir, file_arg) = match (file.parent(), file.file_name()) {
                    (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => {
                        (Some(dir), name.to_string_lossy())
                    }
                    _ => (None, file.to_string_lossy()),
                };
                let mut parts = cmdline
                    .split_whitespace()
                    .map(|part| part.replace(FILE_PLACEHOLDER, &file_arg));
                let program = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("empty extraction command"))?;
                let mut cmd = Command::new(&program);
                cmd.args(parts);
                if let Some(dir) = workdir {
                    cmd.current_dir(dir);
                }
                let status = cmd
                    .status()
                    .with_context(|| format!("running extraction command '{}'", program))?;
                if !status.success() {
                    anyhow::bail!("extraction command '{}' exited with {}", cmdline, status);
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ExtractCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractCommand::Builtin(_) => f.write_str("Builtin(..)"),
            ExtractCommand::External(cmdline) => f.debug_tuple("External").field(cmdline).finish(),
        }
    }
}

/// Pattern → command mapping consulted for every match.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    /// Matched against the lowercased match description.
    pub pattern: Regex,
    /// Extension given to carved files, without the leading dot.
    pub extension: String,
    pub command: ExtractCommand,
}

impl ExtractionRule {
    pub fn new(pattern: &str, extension: &str, command: ExtractCommand) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("invalid extraction pattern '{}'", pattern))?;
        Ok(Self {
            pattern,
            extension: extension.to_string(),
            command,
        })
    }

    pub fn matches(&self, description: &str) -> bool {
        self.pattern.is_match(&description.to_lowercase())
    }
}

/// Maps match descriptions to extraction rules and materializes the output.
///
/// # Extraction sequence
/// 1. Find the first registered rule whose pattern matches the lowercased
///    description (registration order).
/// 2. Copy the source bytes from the match offset to end of file into
///    `<dir>/_<source name>.extracted/<OFFSET as upper hex>.<extension>`.
/// 3. Run the rule's command on that carved file.
///
/// Callers treat any error as a per-match warning; nothing here aborts a scan.
#[derive(Debug, Default)]
pub struct Extractor {
    rules: Vec<ExtractionRule>,
    /// Parent of the per-source `_<name>.extracted` directories. When unset,
    /// each one sits next to its source file.
    output_dir: Option<PathBuf>,
}

impl Extractor {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            rules: Vec::new(),
            output_dir,
        }
    }

    pub fn add_rule(&mut self, rule: ExtractionRule) {
        log::debug!(
            "registered extraction rule '{}' -> .{}",
            rule.pattern.as_str(),
            rule.extension
        );
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ExtractionRule] {
        &self.rules
    }

    /// First rule matching `description`, if any.
    pub fn match_rule(&self, description: &str) -> Option<&ExtractionRule> {
        let lowered = description.to_lowercase();
        self.rules.iter().find(|rule| rule.pattern.is_match(&lowered))
    }

    /// Directory carved files for `source` are written to.
    ///
    /// Always `_<name>.extracted`, so sources sharing a fixed output directory
    /// never overwrite each other's carved files.
    pub fn output_dir_for(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let parent = match &self.output_dir {
            Some(dir) => dir.as_path(),
            None => source.parent().unwrap_or_else(|| Path::new(".")),
        };
        parent.join(format!("_{}.extracted", name))
    }

    /// Carve and extract the stream at `offset` of `source`.
    ///
    /// Returns `Ok(None)` when no rule matches, otherwise the carved file path.
    pub fn extract(
        &self,
        source: &Path,
        offset: u64,
        description: &str,
    ) -> anyhow::Result<Option<PathBuf>> {
        let Some(rule) = self.match_rule(description) else {
            return Ok(None);
        };

        let dir = self.output_dir_for(source);
        fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
        let carved = dir.join(format!("{:X}.{}", offset, rule.extension));
        carve(source, offset, &carved)?;

        log::debug!("running extraction for {:?} at offset {}", carved, offset);
        rule.command
            .run(&carved)
            .with_context(|| format!("extracting {:?}", carved))?;
        Ok(Some(carved))
    }
}

/// Copy `source[offset..]` into `dest`.
fn carve(source: &Path, offset: u64, dest: &Path) -> anyhow::Result<u64> {
    let mut src = BufReader::new(
        File::open(source).with_context(|| format!("opening {:?}", source))?,
    );
    src.seek(SeekFrom::Start(offset))?;
    let mut dst = BufWriter::new(
        File::create(dest).with_context(|| format!("creating carved file {:?}", dest))?,
    );
    let written = io::copy(&mut src, &mut dst)?;
    dst.flush()?;
    Ok(written)
}

/// Anchored pattern matching descriptions that start with `label`, taken
/// literally.
pub fn prefix_pattern(label: &str) -> String {
    format!("^{}", regex::escape(&label.to_lowercase()))
}

/// `path` with its final extension removed (`a/b.deflate` → `a/b`).
pub fn strip_extension(path: &Path) -> PathBuf {
    path.with_extension("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn noop() -> ExtractCommand {
        ExtractCommand::builtin(|_| Ok(()))
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut extractor = Extractor::new(None);
        extractor.add_rule(ExtractionRule::new("^raw deflate", "deflate", noop()).unwrap());
        extractor.add_rule(ExtractionRule::new("^raw", "raw", noop()).unwrap());

        let rule = extractor
            .match_rule("Raw deflate compression stream, uncompressed size >= 40000")
            .unwrap();
        assert_eq!(rule.extension, "deflate");
        assert_eq!(extractor.match_rule("Raw lzma stream").unwrap().extension, "raw");
        assert!(extractor.match_rule("gzip compressed data").is_none());
    }

    #[test]
    fn matching_is_case_normalized() {
        let rule = ExtractionRule::new("^raw deflate", "deflate", noop()).unwrap();
        assert!(rule.matches("RAW DEFLATE compression stream"));
        assert!(!rule.matches("not raw deflate"));
    }

    #[test]
    fn invalid_pattern_rejected() {
        assert!(ExtractionRule::new("(", "x", noop()).is_err());
    }

    #[test]
    fn default_output_dir_sits_next_to_source() {
        let extractor = Extractor::new(None);
        assert_eq!(
            extractor.output_dir_for(Path::new("/fw/image.bin")),
            PathBuf::from("/fw/_image.bin.extracted")
        );
        let fixed = Extractor::new(Some(PathBuf::from("/out")));
        assert_eq!(
            fixed.output_dir_for(Path::new("/fw/image.bin")),
            PathBuf::from("/out/_image.bin.extracted")
        );
        assert_ne!(
            fixed.output_dir_for(Path::new("/a/image.bin")),
            fixed.output_dir_for(Path::new("/b/other.bin"))
        );
    }

    #[test]
    fn strip_extension_drops_last_suffix() {
        assert_eq!(strip_extension(Path::new("out/3E8.deflate")), PathBuf::from("out/3E8"));
        assert_eq!(strip_extension(Path::new("out/3E8")), PathBuf::from("out/3E8"));
    }

    #[test]
    fn extract_carves_tail_and_runs_command() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("image.bin");
        fs::write(&source, b"0123456789abcdef").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut extractor = Extractor::new(Some(tmp.path().join("out")));
        extractor.add_rule(
            ExtractionRule::new(
                "^test stream",
                "bin",
                ExtractCommand::builtin(move |path| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    fs::write(strip_extension(path), b"done")?;
                    Ok(())
                }),
            )
            .unwrap(),
        );

        let carved = extractor
            .extract(&source, 10, "Test stream, uncompressed size >= 1")
            .unwrap()
            .unwrap();
        let dir = tmp.path().join("out").join("_image.bin.extracted");
        assert_eq!(carved, dir.join("A.bin"));
        assert_eq!(fs::read(&carved).unwrap(), b"abcdef");
        assert_eq!(fs::read(dir.join("A")).unwrap(), b"done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(extractor.extract(&source, 0, "something else").unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_command_surfaces_error() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("image.bin");
        fs::write(&source, b"payload").unwrap();

        let mut extractor = Extractor::new(Some(tmp.path().to_path_buf()));
        extractor.add_rule(
            ExtractionRule::new(
                "^test",
                "bin",
                ExtractCommand::builtin(|_| anyhow::bail!("inflate failed")),
            )
            .unwrap(),
        );
        let err = extractor.extract(&source, 0, "test").unwrap_err();
        assert!(format!("{err:#}").contains("inflate failed"));
    }

    #[test]
    fn prefix_pattern_is_literal() {
        let rule = ExtractionRule::new(&prefix_pattern("LZMA (v2.0) stream"), "lzma", noop()).unwrap();
        assert!(rule.matches("LZMA (v2.0) stream, uncompressed size >= 40000"));
        assert!(!rule.matches("lzma v2x0 stream"));
        assert!(!rule.matches("not lzma (v2.0) stream"));
    }

    #[cfg(unix)]
    #[test]
    fn external_command_runs_beside_carved_file() {
        // Relative to the working directory, like a path given on the command line.
        let cwd = std::env::current_dir().unwrap();
        let tmp = TempDir::new_in(&cwd).unwrap();
        let relative = tmp.path().strip_prefix(&cwd).unwrap().join("fw.bin");
        fs::write(&relative, b"headRAWZpayload").unwrap();

        let mut extractor = Extractor::new(None);
        extractor.add_rule(
            ExtractionRule::new(
                "^test",
                "bin",
                ExtractCommand::External("cp %e copied".to_string()),
            )
            .unwrap(),
        );
        let carved = extractor.extract(&relative, 4, "test").unwrap().unwrap();

        let dir = tmp.path().join("_fw.bin.extracted");
        assert_eq!(carved, relative.parent().unwrap().join("_fw.bin.extracted/4.bin"));
        assert_eq!(fs::read(dir.join("copied")).unwrap(), b"RAWZpayload");
    }

    #[cfg(unix)]
    #[test]
    fn failing_external_command_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("4.bin");
        fs::write(&file, b"x").unwrap();
        let cmd = ExtractCommand::External("cp %e missing-dir/copied".to_string());
        assert!(cmd.run(&file).is_err());
    }

    #[test]
    fn empty_external_command_is_an_error() {
        let cmd = ExtractCommand::External("   ".to_string());
        assert!(cmd.run(Path::new("x.bin")).is_err());
    }
}
