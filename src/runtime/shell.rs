//! A tiny POSIX-ish shell used by [`super::MemoryRuntime`].
//!
//! It understands just enough to behave like `sh` for the sandbox layers:
//! variables and `$?`, `cd`/`pwd`/`export`, `echo`/`printf`, `sleep`,
//! `exit`, simple file commands and `>`/`>>` redirection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::time::Duration;

use super::RuntimeError;

/// Directories that reject writes, mimicking kernel pseudo filesystems.
const READ_ONLY_ROOTS: &[&str] = &["/proc", "/sys"];

/// In-memory filesystem of one fake container.
#[derive(Debug, Clone)]
pub(super) struct Filesystem {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Filesystem {
    pub(super) fn new(work_dir: &str) -> Self {
        let mut fs = Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
        };
        for dir in ["/", "/tmp", "/root", "/proc", "/sys", work_dir] {
            fs.insert_dir_all(dir);
        }
        fs
    }

    fn insert_dir_all(&mut self, path: &str) {
        let mut current = String::new();
        self.dirs.insert("/".to_string());
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    pub(super) fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    pub(super) fn mkdir_all(&mut self, path: &str) -> Result<(), RuntimeError> {
        check_writable(path)?;
        if self.files.contains_key(path) {
            return Err(RuntimeError::rejected(format!("{path}: File exists")));
        }
        self.insert_dir_all(path);
        Ok(())
    }

    pub(super) fn write(&mut self, path: &str, data: Vec<u8>) -> Result<(), RuntimeError> {
        check_writable(path)?;
        if self.dirs.contains(path) {
            return Err(RuntimeError::rejected(format!("{path}: Is a directory")));
        }
        if !self.dirs.contains(parent_of(path)) {
            return Err(RuntimeError::not_found(format!(
                "{}: No such file or directory",
                parent_of(path)
            )));
        }
        self.files.insert(path.to_string(), data);
        Ok(())
    }

    pub(super) fn append(&mut self, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let mut contents = self.files.get(path).cloned().unwrap_or_default();
        contents.extend_from_slice(data);
        self.write(path, contents)
    }

    pub(super) fn read(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        if self.dirs.contains(path) {
            return Err(RuntimeError::rejected(format!("{path}: Is a directory")));
        }
        self.files.get(path).cloned().ok_or_else(|| {
            RuntimeError::not_found(format!("{path}: No such file or directory"))
        })
    }

    fn remove(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }

    fn list(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.dirs
            .iter()
            .chain(self.files.keys())
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn check_writable(path: &str) -> Result<(), RuntimeError> {
    let denied = READ_ONLY_ROOTS
        .iter()
        .any(|root| path == *root || path.starts_with(&format!("{root}/")));
    if denied {
        Err(RuntimeError::permission_denied(format!(
            "{path}: Read-only file system"
        )))
    } else {
        Ok(())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Lexically resolves `path` against `cwd`.
pub(super) fn resolve(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// What the shell loop should do after a statement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Step {
    Done,
    Sleep(Duration),
    Exit(i32),
}

/// Shell state that persists between statements.
#[derive(Debug, Clone)]
pub(super) struct Interpreter {
    cwd: String,
    vars: BTreeMap<String, String>,
    status: i32,
    pid: u32,
    /// Set by `trap '' INT`.
    ignore_interrupt: bool,
}

impl Interpreter {
    pub(super) fn new(work_dir: &str, env: &BTreeMap<String, String>) -> Self {
        Self {
            cwd: work_dir.to_string(),
            vars: env.clone(),
            status: 0,
            pid: 1,
            ignore_interrupt: false,
        }
    }

    /// Sets the value `$$` expands to.
    pub(super) fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub(super) fn ignores_interrupt(&self) -> bool {
        self.ignore_interrupt
    }

    pub(super) fn status(&self) -> i32 {
        self.status
    }

    pub(super) fn set_status(&mut self, status: i32) {
        self.status = status;
    }

    /// Runs one statement, writing to `out` and `err`.
    pub(super) fn eval(
        &mut self,
        statement: &str,
        fs: &mut Filesystem,
        out: &mut Vec<u8>,
        err: &mut Vec<u8>,
    ) -> Step {
        let words = match shell_words::split(statement) {
            Ok(words) => words,
            Err(e) => {
                let _ = writeln!(Sink(err), "sh: syntax error: {e}");
                self.status = 2;
                return Step::Done;
            }
        };
        let words: Vec<String> = words.iter().map(|w| self.expand(w)).collect();
        let (args, redirect) = split_redirect(words);
        let Some((program, rest)) = args.split_first() else {
            return Step::Done;
        };

        if let Some((name, value)) = assignment(program) {
            self.vars.insert(name.to_string(), value.to_string());
            self.status = 0;
            return Step::Done;
        }

        let mut stdout = Vec::new();
        let (status, step) = self.builtin(program, rest, fs, &mut stdout, err);
        self.status = status;

        match redirect {
            Some(Redirect { path, append }) => {
                let target = resolve(&self.cwd, &path);
                let written = if append {
                    fs.append(&target, &stdout)
                } else {
                    fs.write(&target, stdout)
                };
                if let Err(e) = written {
                    let _ = writeln!(Sink(err), "sh: cannot create {path}: {}", e.message());
                    self.status = 2;
                }
            }
            None => out.extend_from_slice(&stdout),
        }
        step
    }

    fn builtin(
        &mut self,
        program: &str,
        args: &[String],
        fs: &mut Filesystem,
        out: &mut Vec<u8>,
        err: &mut Vec<u8>,
    ) -> (i32, Step) {
        match program {
            ":" | "true" | "stty" => (0, Step::Done),
            "trap" => {
                if args.iter().skip(1).any(|sig| sig == "INT" || sig == "SIGINT" || sig == "2") {
                    match args.first().map(String::as_str) {
                        Some("") => self.ignore_interrupt = true,
                        Some("-") => self.ignore_interrupt = false,
                        _ => {}
                    }
                }
                (0, Step::Done)
            }
            "false" => (1, Step::Done),
            "pwd" => {
                out.extend_from_slice(self.cwd.as_bytes());
                out.push(b'\n');
                (0, Step::Done)
            }
            "cd" => {
                let requested = match args.first() {
                    Some(dir) => dir.clone(),
                    None => self
                        .vars
                        .get("HOME")
                        .cloned()
                        .unwrap_or_else(|| "/root".to_string()),
                };
                let target = resolve(&self.cwd, &requested);
                if fs.is_dir(&target) {
                    self.cwd = target;
                    (0, Step::Done)
                } else {
                    let _ = writeln!(Sink(err), "sh: cd: can't cd to {requested}");
                    (2, Step::Done)
                }
            }
            "echo" => {
                let (newline, words) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                out.extend_from_slice(words.join(" ").as_bytes());
                if newline {
                    out.push(b'\n');
                }
                (0, Step::Done)
            }
            "printf" => match args.split_first() {
                Some((format, values)) => {
                    out.extend_from_slice(printf(format, values).as_bytes());
                    (0, Step::Done)
                }
                None => {
                    let _ = writeln!(Sink(err), "printf: usage: printf format [arguments]");
                    (2, Step::Done)
                }
            },
            "export" => {
                for arg in args {
                    if let Some((name, value)) = assignment(arg) {
                        self.vars.insert(name.to_string(), value.to_string());
                    }
                }
                (0, Step::Done)
            }
            "unset" => {
                for arg in args {
                    self.vars.remove(arg);
                }
                (0, Step::Done)
            }
            "env" => {
                for (name, value) in &self.vars {
                    let _ = writeln!(Sink(out), "{name}={value}");
                }
                (0, Step::Done)
            }
            "sleep" => match args.first().and_then(|s| s.parse::<f64>().ok()) {
                Some(secs) if secs >= 0.0 && secs.is_finite() => {
                    (0, Step::Sleep(Duration::from_secs_f64(secs)))
                }
                _ => {
                    let _ = writeln!(Sink(err), "sleep: invalid time interval");
                    (1, Step::Done)
                }
            },
            "exit" => {
                let code = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(self.status);
                (code, Step::Exit(code))
            }
            "cat" => {
                let mut status = 0;
                for arg in args {
                    match fs.read(&resolve(&self.cwd, arg)) {
                        Ok(contents) => out.extend_from_slice(&contents),
                        Err(e) => {
                            let _ = writeln!(Sink(err), "cat: {arg}: {}", reason(&e));
                            status = 1;
                        }
                    }
                }
                (status, Step::Done)
            }
            "mkdir" => {
                let mut status = 0;
                for arg in args.iter().filter(|a| !a.starts_with('-')) {
                    if let Err(e) = fs.mkdir_all(&resolve(&self.cwd, arg)) {
                        let _ = writeln!(Sink(err), "mkdir: {arg}: {}", reason(&e));
                        status = 1;
                    }
                }
                (status, Step::Done)
            }
            "rm" => {
                let force = args.iter().any(|a| a == "-f");
                let mut status = 0;
                for arg in args.iter().filter(|a| !a.starts_with('-')) {
                    if !fs.remove(&resolve(&self.cwd, arg)) && !force {
                        let _ = writeln!(Sink(err), "rm: {arg}: No such file or directory");
                        status = 1;
                    }
                }
                (status, Step::Done)
            }
            "ls" => {
                let dir = resolve(&self.cwd, args.first().map_or(".", String::as_str));
                if fs.is_dir(&dir) {
                    for name in fs.list(&dir) {
                        let _ = writeln!(Sink(out), "{name}");
                    }
                    (0, Step::Done)
                } else {
                    let _ = writeln!(Sink(err), "ls: {dir}: No such file or directory");
                    (2, Step::Done)
                }
            }
            other => {
                let _ = writeln!(Sink(err), "sh: 1: {other}: not found");
                (127, Step::Done)
            }
        }
    }

    /// Expands `$?`, `$$`, `$NAME` and `${NAME}` inside one word.
    fn expand(&self, word: &str) -> String {
        let mut result = String::new();
        let mut chars = word.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                result.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some('?') => {
                    chars.next();
                    result.push_str(&self.status.to_string());
                }
                Some('$') => {
                    chars.next();
                    result.push_str(&self.pid.to_string());
                }
                Some('{') => {
                    chars.next();
                    let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                    result.push_str(self.vars.get(&name).map_or("", String::as_str));
                }
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    result.push_str(self.vars.get(&name).map_or("", String::as_str));
                }
                _ => result.push('$'),
            }
        }
        result
    }
}

/// Adapts a byte buffer to `fmt::Write`.
struct Sink<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for Sink<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

fn reason(err: &RuntimeError) -> &'static str {
    if err.is_not_found() {
        "No such file or directory"
    } else if err.is_permission_denied() {
        "Permission denied"
    } else {
        "Invalid argument"
    }
}

struct Redirect {
    path: String,
    append: bool,
}

/// Separates stdout redirection from the argument list. `2>` targets are dropped.
fn split_redirect(words: Vec<String>) -> (Vec<String>, Option<Redirect>) {
    let mut args = Vec::new();
    let mut redirect = None;
    let mut iter = words.into_iter();
    while let Some(word) = iter.next() {
        if let Some(target) = word.strip_prefix("2>") {
            if target.is_empty() {
                iter.next();
            }
        } else if let Some(target) = word.strip_prefix(">>") {
            let path = if target.is_empty() { iter.next() } else { Some(target.to_string()) };
            redirect = path.map(|path| Redirect { path, append: true });
        } else if let Some(target) = word.strip_prefix('>') {
            let path = if target.is_empty() { iter.next() } else { Some(target.to_string()) };
            redirect = path.map(|path| Redirect { path, append: false });
        } else {
            args.push(word);
        }
    }
    (args, redirect)
}

fn assignment(word: &str) -> Option<(&str, &str)> {
    let (name, value) = word.split_once('=')?;
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    valid.then_some((name, value))
}

fn printf(format: &str, values: &[String]) -> String {
    let mut result = String::new();
    let mut values = values.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some(other) => result.push(other),
                None => result.push('\\'),
            },
            '%' => match chars.next() {
                Some('s' | 'd') => result.push_str(values.next().map_or("", String::as_str)),
                Some('%') => result.push('%'),
                Some(other) => {
                    result.push('%');
                    result.push(other);
                }
                None => result.push('%'),
            },
            other => result.push(other),
        }
    }
    result
}

/// Splits a command line into statements on unquoted `;`.
pub(super) fn split_statements(line: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match (quote, c) {
            (None, ';') => statements.push(std::mem::take(&mut current)),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
