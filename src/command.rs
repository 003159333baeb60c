use std::path::{Path, PathBuf};

/// Run-wide options that shape every conversion command.
#[derive(Debug, Clone, Copy)]
pub struct ConversionOptions<'a> {
    pub output_dir: &'a Path,
    /// Append the profile name to output file stems.
    pub tagged: bool,
    /// Burn in the task's subtitle file when it has one.
    pub subtitle: bool,
    pub threads: usize,
}

/// A fully synthesised encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCommand {
    /// The encoder executable.
    pub program: PathBuf,
    /// Arguments in the order they are passed to the encoder.
    pub args: Vec<String>,
    /// The file the encoder will write.
    pub output: PathBuf,
}

/// A fluent builder for ffmpeg conversion arguments.
///
/// Options are stored so that the last call wins; the argument order produced
/// by [`build_args`](Self::build_args) is fixed.
pub struct CommandBuilder {
    // The path to the encoder executable
    encoder_path: PathBuf,
    input: PathBuf,
    output: PathBuf,

    params: Vec<String>,
    subtitle_file: Option<PathBuf>,
    threads: Option<usize>,
    overwrite: bool,
}

impl CommandBuilder {
    /// Creates a new `CommandBuilder` converting `input` into `output`.
    pub fn new(encoder_path: impl Into<PathBuf>, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        CommandBuilder {
            encoder_path: encoder_path.into(),
            input: input.into(),
            output: output.into(),
            params: Vec::new(),
            subtitle_file: None,
            threads: None,
            overwrite: true,
        }
    }

    /// Sets the encoder parameters of the quality preset.
    ///
    /// e.g., `["-c:v", "libx264", "-crf", "23"]`
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Burns the given subtitle file into the video.
    pub fn subtitle_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.subtitle_file = Some(path.into());
        self
    }

    /// Sets the number of encoder threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Whether an existing output file is overwritten (`-y`) or kept (`-n`).
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Builds the final list of command-line arguments based on the configured options.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-i".into(), self.input.display().to_string()];

        if let Some(subtitle) = &self.subtitle_file {
            args.extend([
                "-vf".into(),
                format!("subtitles={}", escape_filter_path(subtitle)),
            ]);
        }

        args.extend(self.params.iter().cloned());

        if let Some(threads) = &self.threads {
            args.extend(["-threads".into(), threads.to_string()]);
        }

        args.push(if self.overwrite { "-y" } else { "-n" }.into());
        args.push(self.output.display().to_string());

        args
    }

    pub fn build(self) -> ConversionCommand {
        let args = self.build_args();
        ConversionCommand {
            program: self.encoder_path,
            args,
            output: self.output,
        }
    }
}

/// Escapes a path for use inside an ffmpeg filter argument.
fn escape_filter_path(path: &Path) -> String {
    let mut escaped = String::new();
    for c in path.display().to_string().chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | '[' | ']' | ';') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_filter_path() {
        assert_eq!(
            escape_filter_path(Path::new("/subs/it's [v2].srt")),
            r"/subs/it\'s \[v2\].srt"
        );
    }
}
