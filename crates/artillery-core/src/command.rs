//! Deterministic mapping from an [`OptionSet`] to the downloader's argv.
//!
//! Emission order is fixed: program, base args, the input group, toggles,
//! valued options, cookies, archive. Persisted command strings are compared
//! byte-for-byte, so nothing here may depend on map iteration order.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{InputMode, OptionSet, TaskError, TaskName, TaskResult, Toggles, ValuedOptions};

/// Task-relative cookie file the user places by hand.
pub const COOKIE_FILE: &str = "cookies.txt";
pub const LEDGER_EXTENSION: &str = "ledger";

fn toggle_flags(t: &Toggles) -> [(&'static str, bool); 5] {
    [
        ("--write-unsupported", t.write_unsupported),
        ("--no-skip", t.no_skip),
        ("--write-metadata", t.write_metadata),
        ("--write-info-json", t.write_info_json),
        ("--write-tags", t.write_tags),
    ]
}

fn valued_flags(v: &ValuedOptions) -> [(&'static str, Option<&str>); 8] {
    [
        ("--retries", v.retries.as_deref()),
        ("--limit-rate", v.limit_rate.as_deref()),
        ("--sleep", v.sleep.as_deref()),
        ("--sleep-request", v.sleep_request.as_deref()),
        ("--sleep-429", v.sleep_429.as_deref()),
        ("--sleep-extractor", v.sleep_extractor.as_deref()),
        ("--rename", v.rename.as_deref()),
        ("--rename-to", v.rename_to.as_deref()),
    ]
}

fn valued_slot<'a>(v: &'a mut ValuedOptions, flag: &str) -> Option<&'a mut Option<String>> {
    Some(match flag {
        "--retries" => &mut v.retries,
        "--limit-rate" => &mut v.limit_rate,
        "--sleep" => &mut v.sleep,
        "--sleep-request" => &mut v.sleep_request,
        "--sleep-429" => &mut v.sleep_429,
        "--sleep-extractor" => &mut v.sleep_extractor,
        "--rename" => &mut v.rename,
        "--rename-to" => &mut v.rename_to,
        _ => return None,
    })
}

fn toggle_slot<'a>(t: &'a mut Toggles, flag: &str) -> Option<&'a mut bool> {
    Some(match flag {
        "--write-unsupported" => &mut t.write_unsupported,
        "--no-skip" => &mut t.no_skip,
        "--write-metadata" => &mut t.write_metadata,
        "--write-info-json" => &mut t.write_info_json,
        "--write-tags" => &mut t.write_tags,
        _ => return None,
    })
}

/// Built argv for one task. `Display` renders the canonical, shell-quoted
/// string that is persisted as `command.txt`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    argv: Vec<String>,
}

impl CommandLine {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&quote_arg(arg))?;
        }
        Ok(())
    }
}

/// Program, fixed leading arguments and ledger location shared by every task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBuilder {
    pub program: String,
    pub base_args: Vec<String>,
    pub ledger_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>, base_args: Vec<String>, ledger_dir: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), base_args, ledger_dir: ledger_dir.into() }
    }

    /// Dedup ledger for `name`; lives outside the task directory.
    pub fn ledger_path(&self, name: &TaskName) -> PathBuf {
        ledger_path(&self.ledger_dir, name)
    }

    pub fn build(&self, name: &TaskName, input_list: &[String], options: &OptionSet) -> TaskResult<CommandLine> {
        let mut argv = Vec::with_capacity(self.base_args.len() + 16);
        argv.push(self.program.clone());
        argv.extend(self.base_args.iter().cloned());

        match &options.input {
            InputMode::List { file } => {
                let file = file.trim();
                if file.is_empty() {
                    return Err(TaskError::validation("list input mode needs a file name"));
                }
                if file.contains(|c| c == '/' || c == '\\') || file == "." || file == ".." {
                    return Err(TaskError::validation(format!("list file {file:?} must be a plain file name")));
                }
                argv.push("-i".to_string());
                argv.push(file.to_string());
            }
            InputMode::FilterSingle { filter } => {
                let filter = filter.trim();
                if filter.is_empty() {
                    return Err(TaskError::validation("filter input mode needs a filter expression"));
                }
                let url = input_list
                    .iter()
                    .map(|l| l.trim())
                    .find(|l| !l.is_empty())
                    .ok_or_else(|| TaskError::validation("filter input mode needs a non-empty input line"))?;
                argv.push("-I".to_string());
                argv.push(filter.to_string());
                argv.push(url.to_string());
            }
        }

        for (flag, enabled) in toggle_flags(&options.toggles) {
            if enabled {
                argv.push(flag.to_string());
            }
        }

        for (flag, value) in valued_flags(&options.values) {
            if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
                argv.push(flag.to_string());
                argv.push(value.to_string());
            }
        }

        if options.cookies {
            argv.push("-C".to_string());
            argv.push(COOKIE_FILE.to_string());
        }

        if options.download_archive {
            argv.push("--download-archive".to_string());
            argv.push(self.ledger_path(name).to_string_lossy().into_owned());
        }

        Ok(CommandLine::new(argv))
    }
}

pub fn ledger_path(ledger_dir: &Path, name: &TaskName) -> PathBuf {
    ledger_dir.join(format!("{}.{}", name.as_str(), LEDGER_EXTENSION))
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '+' | '@' | '%')
}

/// Single-quotes `arg` unless every character is shell-safe.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Splits a command string the way a POSIX shell would for the subset we
/// ever write: bare words, single quotes, double quotes, backslash escapes.
pub fn split_command_line(line: &str) -> TaskResult<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => cur.push(c),
                        None => return Err(TaskError::validation("unterminated single quote in command line")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => cur.push(c),
                            Some(c) => {
                                cur.push('\\');
                                cur.push(c);
                            }
                            None => return Err(TaskError::validation("unterminated double quote in command line")),
                        },
                        Some(c) => cur.push(c),
                        None => return Err(TaskError::validation("unterminated double quote in command line")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    cur.push(c);
                }
            }
            c => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if in_word {
        out.push(cur);
    }
    Ok(out)
}

/// Recovers an [`OptionSet`] from a persisted command string. Used for
/// records that predate `options.json`; unknown tokens are ignored.
pub fn parse_command_line(line: &str) -> TaskResult<OptionSet> {
    let tokens = split_command_line(line)?;
    let mut opts = OptionSet::default();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        let next = tokens.get(i + 1);
        match token {
            "-i" => {
                if let Some(file) = next {
                    opts.input = InputMode::List { file: file.clone() };
                    i += 1;
                }
            }
            "-I" => {
                if let Some(filter) = next {
                    opts.input = InputMode::FilterSingle { filter: filter.clone() };
                    // the URL operand comes from the input list, not from here
                    i += if tokens.get(i + 2).is_some() { 2 } else { 1 };
                }
            }
            "-C" => {
                if next.map(String::as_str) == Some(COOKIE_FILE) {
                    opts.cookies = true;
                    i += 1;
                }
            }
            "--download-archive" => {
                opts.download_archive = true;
                if next.is_some() {
                    i += 1;
                }
            }
            flag => {
                if let Some(slot) = toggle_slot(&mut opts.toggles, flag) {
                    *slot = true;
                } else if let Some(value) = next {
                    if let Some(slot) = valued_slot(&mut opts.values, flag) {
                        *slot = Some(value.clone());
                        i += 1;
                    }
                }
            }
        }
        i += 1;
    }
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(
            "gallery-dl",
            vec!["--no-input".into(), "--verbose".into()],
            "/data/ledgers",
        )
    }

    fn name() -> TaskName {
        TaskName::parse("task_1").unwrap()
    }

    fn urls() -> Vec<String> {
        vec!["https://example.com/a".into(), "https://example.com/b".into()]
    }

    #[test]
    fn default_options_emit_list_input_only() {
        let cmd = builder().build(&name(), &urls(), &OptionSet::default()).unwrap();
        assert_eq!(cmd.to_string(), "gallery-dl --no-input --verbose -i url_list.txt");
        assert_eq!(cmd.program(), Some("gallery-dl"));
    }

    #[test]
    fn full_option_set_has_fixed_order() {
        let mut opts = OptionSet::default();
        opts.toggles.write_tags = true;
        opts.toggles.write_unsupported = true;
        opts.values.rename_to = Some("{id}.{extension}".into());
        opts.values.retries = Some(" 3 ".into());
        opts.values.sleep = Some("   ".into());
        opts.cookies = true;
        opts.download_archive = true;

        let cmd = builder().build(&name(), &urls(), &opts).unwrap();
        assert_eq!(
            cmd.to_string(),
            "gallery-dl --no-input --verbose -i url_list.txt --write-unsupported --write-tags \
             --retries 3 --rename-to '{id}.{extension}' -C cookies.txt \
             --download-archive /data/ledgers/task_1.ledger"
        );
    }

    #[test]
    fn valued_option_with_whitespace_stays_one_token() {
        let mut opts = OptionSet::default();
        opts.values.limit_rate = Some("500k 1M".into());
        let cmd = builder().build(&name(), &urls(), &opts).unwrap();
        let pos = cmd.argv().iter().position(|a| a == "--limit-rate").unwrap();
        assert_eq!(cmd.argv()[pos + 1], "500k 1M");
        assert!(cmd.to_string().ends_with("--limit-rate '500k 1M'"));
    }

    #[test]
    fn filter_mode_uses_first_non_empty_line() {
        let opts = OptionSet {
            input: InputMode::FilterSingle { filter: "extension in ('jpg', 'png')".into() },
            ..OptionSet::default()
        };
        let inputs = vec!["   ".to_string(), " https://example.com/x ".into(), "https://example.com/y".into()];
        let cmd = builder().build(&name(), &inputs, &opts).unwrap();
        assert_eq!(
            cmd.args()[2..].to_vec(),
            vec!["-I", "extension in ('jpg', 'png')", "https://example.com/x"]
        );
        assert!(!cmd.argv().iter().any(|a| a == "-i"));
        assert!(cmd.to_string().contains(r"-I 'extension in ('\''jpg'\'', '\''png'\'')'"));
    }

    #[test]
    fn filter_mode_validation() {
        let opts = OptionSet {
            input: InputMode::FilterSingle { filter: "  ".into() },
            ..OptionSet::default()
        };
        assert!(builder().build(&name(), &urls(), &opts).unwrap_err().is_validation());

        let opts = OptionSet {
            input: InputMode::FilterSingle { filter: "true".into() },
            ..OptionSet::default()
        };
        assert!(builder().build(&name(), &["".to_string()], &opts).unwrap_err().is_validation());
    }

    #[test]
    fn empty_list_file_is_rejected() {
        let opts = OptionSet { input: InputMode::List { file: " ".into() }, ..OptionSet::default() };
        assert!(builder().build(&name(), &urls(), &opts).is_err());
        let opts = OptionSet { input: InputMode::List { file: "../other/url_list.txt".into() }, ..OptionSet::default() };
        assert!(builder().build(&name(), &urls(), &opts).unwrap_err().is_validation());
    }

    #[test]
    fn quote_arg_cases() {
        assert_eq!(quote_arg("plain-word_1.txt"), "plain-word_1.txt");
        assert_eq!(quote_arg(""), "''");
        assert_eq!(quote_arg("a b"), "'a b'");
        assert_eq!(quote_arg("it's"), r"'it'\''s'");
        assert_eq!(quote_arg("$HOME"), "'$HOME'");
    }

    #[test]
    fn split_handles_quotes_and_escapes() {
        let parts = split_command_line(r#"a 'b c' "d \"e\"" f\ g 'it'\''s' ''"#).unwrap();
        assert_eq!(parts, vec!["a", "b c", "d \"e\"", "f g", "it's", ""]);
        assert!(split_command_line("'open").is_err());
    }

    #[test]
    fn parse_recovers_built_options() {
        let mut opts = OptionSet::default();
        opts.toggles.no_skip = true;
        opts.toggles.write_metadata = true;
        opts.values.sleep_429 = Some("30".into());
        opts.values.rename = Some("{title} - {num}".into());
        opts.cookies = true;
        opts.download_archive = true;
        let cmd = builder().build(&name(), &urls(), &opts).unwrap();
        assert_eq!(parse_command_line(&cmd.to_string()).unwrap(), opts);
    }

    #[test]
    fn parse_reads_legacy_unquoted_commands() {
        let legacy = "gallery-dl -f /O -d /downloads --no-input --verbose --write-log log.txt --no-part \
                      -i url_list.txt --write-tags --retries 5 -C cookies.txt --download-archive task_1.sqlite";
        let opts = parse_command_line(legacy).unwrap();
        assert_eq!(opts.input, InputMode::List { file: "url_list.txt".into() });
        assert!(opts.toggles.write_tags);
        assert_eq!(opts.values.retries.as_deref(), Some("5"));
        assert!(opts.cookies);
        assert!(opts.download_archive);
    }

    #[test]
    fn parse_reads_filter_mode() {
        let opts = parse_command_line("gallery-dl -I 'date > now' 'https://x/y' --no-skip").unwrap();
        assert_eq!(opts.input, InputMode::FilterSingle { filter: "date > now".into() });
        assert!(opts.toggles.no_skip);
    }
}
