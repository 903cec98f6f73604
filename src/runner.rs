//! Running the external FSL tools.
//!
//! Commands are structured values, never concatenated shell strings. Outputs a
//! command writes are declared on it, which lets [`execute`] stage them under
//! temporary names and only move them into place once the tool succeeded and
//! the files check out. A failed or timed out tool therefore never leaves a
//! file that a later existence check would mistake for a finished artifact.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array2;

use crate::config::TransformConfig;
use crate::error::{Result, TransformError};
use crate::image::{format_affine, ImageHandle, MatrixHandle};
use crate::util::write_empty_nifti;

/// What a declared output is, which decides how it is validated and moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Matrix,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub kind: OutputKind,
    /// The `.mat` file, or the extension-less image name passed to the tool.
    pub path: PathBuf,
}

impl Output {
    fn is_complete(&self) -> bool {
        match self.kind {
            OutputKind::Matrix => MatrixHandle::new(&self.path).is_complete(),
            OutputKind::Image => ImageHandle::new(&self.path).is_complete(),
        }
    }

    fn discard(&self) -> Result<()> {
        match self.kind {
            OutputKind::Matrix => MatrixHandle::new(&self.path).remove(),
            OutputKind::Image => ImageHandle::new(&self.path).remove(),
        }
    }

    fn move_to(&self, dest: &Output) -> Result<()> {
        match self.kind {
            OutputKind::Matrix => {
                fs::rename(&self.path, &dest.path)?;
            }
            OutputKind::Image => {
                ImageHandle::new(&self.path).rename_to(&ImageHandle::new(&dest.path))?;
            }
        }
        Ok(())
    }

    /// The sibling the tool writes to before the output is moved into place.
    fn staged(&self) -> Output {
        let pid = std::process::id();
        let path = match self.kind {
            OutputKind::Matrix => {
                let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned());
                let ext = self.path.extension().map(|s| s.to_string_lossy().into_owned());
                let name = match ext {
                    Some(ext) => format!("{}_tmp{}.{}", stem.unwrap_or_default(), pid, ext),
                    None => format!("{}_tmp{}", stem.unwrap_or_default(), pid),
                };
                self.path.with_file_name(name)
            }
            OutputKind::Image => {
                let img = ImageHandle::new(&self.path);
                img.sibling(&format!("{}_tmp{}", img.name(), pid)).stem_path()
            }
        };
        Output { kind: self.kind, path }
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Plain(String),
    /// A declared output, rendered as `prefix` followed by its current path.
    Output { prefix: String, index: usize },
}

/// One invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<Arg>,
    outputs: Vec<Output>,
}

impl ToolCommand {
    pub fn new(program: &str) -> ToolCommand {
        ToolCommand {
            program: program.to_string(),
            args: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> ToolCommand {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(Arg::Plain(arg.into()));
        }
        self
    }

    /// A path argument, with an optional `--flag=` style prefix.
    pub fn path<P: AsRef<Path>>(self, prefix: &str, path: P) -> ToolCommand {
        self.arg(format!("{}{}", prefix, path.as_ref().display()))
    }

    /// An image argument, passed without extension as FSL expects.
    pub fn image(self, prefix: &str, img: &ImageHandle) -> ToolCommand {
        self.path(prefix, img.stem_path())
    }

    /// Declare an output. A `prefix` ending in `=` is glued to the path,
    /// any other non-empty prefix becomes a separate flag argument.
    pub fn output<P: Into<PathBuf>>(mut self, prefix: &str, kind: OutputKind, path: P) -> ToolCommand {
        let mut path = path.into();
        if kind == OutputKind::Image {
            path = ImageHandle::new(path).stem_path();
        }
        let index = self.outputs.len();
        self.outputs.push(Output { kind, path });
        if prefix.is_empty() || prefix.ends_with('=') {
            self.args.push(Arg::Output { prefix: prefix.to_string(), index });
        } else {
            self.args.push(Arg::Plain(prefix.to_string()));
            self.args.push(Arg::Output { prefix: String::new(), index });
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// The rendered argument vector, excluding the program.
    pub fn argv(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Plain(s) => s.clone(),
                Arg::Output { prefix, index } => {
                    format!("{}{}", prefix, self.outputs[*index].path.display())
                }
            })
            .collect()
    }

    /// Whether the rendered arguments contain `needle` as a whole argument.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.argv().iter().any(|a| a == needle)
    }

    /// The value following `flag`, e.g. `value_of("-dof")`.
    pub fn value_of(&self, flag: &str) -> Option<String> {
        let argv = self.argv();
        argv.iter()
            .position(|a| a == flag)
            .and_then(|idx| argv.get(idx + 1).cloned())
    }

    /// The command line as a shell would show it, for logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.argv().into_iter().map(|a| {
                if a.is_empty() || a.contains(char::is_whitespace) {
                    format!("'{}'", a.replace('\'', "'\\''"))
                } else {
                    a
                }
            }))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn with_outputs(&self, outputs: Vec<Output>) -> ToolCommand {
        ToolCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            outputs,
        }
    }
}


/// Executes external commands and returns their standard output.
pub trait ToolRunner {
    fn run(&self, command: &ToolCommand) -> Result<String>;
}


/// Run `command`, staging its declared outputs so that they only appear under
/// their final names if the tool succeeded and every output is a complete file.
pub fn execute(runner: &dyn ToolRunner, command: &ToolCommand) -> Result<String> {
    let staged: Vec<Output> = command.outputs().iter().map(Output::staged).collect();
    let staged_command = command.with_outputs(staged.clone());

    for out in staged.iter() {
        if let Some(dir) = out.path.parent() {
            fs::create_dir_all(dir)?;
        }
        out.discard()?;
    }

    let stdout = match runner.run(&staged_command) {
        Ok(stdout) => stdout,
        Err(err) => {
            discard_all(&staged);
            return Err(err);
        }
    };

    if let Some(missing) = staged.iter().position(|out| !out.is_complete()) {
        discard_all(&staged);
        return Err(TransformError::tool_failure(
            staged_command.command_line(),
            String::from("exited successfully"),
            format!(
                "declared output {} is missing or incomplete",
                command.outputs()[missing].path.display()
            ),
        ));
    }

    for (tmp, out) in staged.iter().zip(command.outputs().iter()) {
        if let Err(err) = tmp.move_to(out) {
            discard_all(&staged);
            return Err(err);
        }
    }
    Ok(stdout)
}

fn discard_all(outputs: &[Output]) {
    for out in outputs {
        if let Err(err) = out.discard() {
            tracing::warn!(path = %out.path.display(), error = %err, "could not remove partial output");
        }
    }
}


/// Runs the FSL binaries as child processes.
#[derive(Debug, Clone)]
pub struct FslRunner {
    fsl_dir: PathBuf,
    timeout: Option<Duration>,
    log_file: Option<PathBuf>,
}

impl FslRunner {
    pub fn new(config: &TransformConfig) -> FslRunner {
        FslRunner {
            fsl_dir: config.fsl_dir.clone(),
            timeout: config.timeout(),
            log_file: config.log_file.clone(),
        }
    }

    /// `<fsl_dir>/bin/<program>` if present, else the bare name looked up on `PATH`.
    fn binary(&self, program: &str) -> PathBuf {
        let bin = self.fsl_dir.join("bin").join(program);
        if bin.is_file() {
            bin
        } else {
            PathBuf::from(program)
        }
    }

    fn log(&self, line: &str, stdout: &str, stderr: &str) {
        let path = match &self.log_file {
            Some(path) => path,
            None => return,
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}\n{}{}", line, stdout, stderr));
        if let Err(err) = written {
            tracing::warn!(log_file = %path.display(), error = %err, "could not append to log file");
        }
    }
}

impl ToolRunner for FslRunner {
    fn run(&self, command: &ToolCommand) -> Result<String> {
        let line = command.command_line();
        tracing::info!(program = command.program(), command = %line, "running external tool");

        let failure = |status: String, stderr: String| TransformError::tool_failure(line.clone(), status, stderr);

        let mut process = Command::new(self.binary(command.program()));
        process
            .args(command.argv())
            .env("FSLDIR", &self.fsl_dir)
            .env("FSLOUTPUTTYPE", "NIFTI_GZ")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // FSL tools are often shell wrappers; the group holds everything they start.
            process.process_group(0);
        }
        let mut child = process
            .spawn()
            .map_err(|e| failure(String::from("could not start"), e.to_string()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_group(&mut child);
                    break child.wait()?;
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Descendants that outlive the tool keep the pipes open.
        let deadline = self.timeout.map(|t| started + t + PIPE_GRACE);
        let stdout = String::from_utf8_lossy(&collect(&stdout, deadline)).into_owned();
        let stderr = String::from_utf8_lossy(&collect(&stderr, deadline)).into_owned();
        self.log(&line, &stdout, &stderr);

        if timed_out {
            let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
            tracing::error!(program = command.program(), "timed out after {}s", secs);
            return Err(failure(format!("timed out after {}s", secs), stderr));
        }
        if !status.success() {
            tracing::error!(program = command.program(), %status, "external tool failed");
            return Err(failure(status.to_string(), stderr));
        }
        Ok(stdout)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PIPE_GRACE: Duration = Duration::from_millis(500);

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Whatever the reader got, waiting at most until `deadline`.
fn collect(rx: &Receiver<Vec<u8>>, deadline: Option<Instant>) -> Vec<u8> {
    match deadline {
        Some(deadline) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default(),
        None => rx.recv().unwrap_or_default(),
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // the child was spawned as leader of its own group, so its pid is the group id
    let pgid = child.id() as libc::pid_t;
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}


/// A runner that records commands instead of running FSL.
///
/// Declared outputs are materialized (an identity matrix or a header-only image),
/// so the staging in [`execute`] and every later existence check behave as with
/// the real tools. Programs can be scripted to print a given stdout or to fail.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ToolCommand>>,
    responses: HashMap<String, String>,
    failing: HashSet<String>,
    silent: HashSet<String>,
}

impl RecordingRunner {
    pub fn new() -> RecordingRunner {
        RecordingRunner::default()
    }

    /// Print `stdout` whenever `program` runs.
    pub fn respond(mut self, program: &str, stdout: &str) -> RecordingRunner {
        self.responses.insert(program.to_string(), stdout.to_string());
        self
    }

    /// Make `program` exit with status 1.
    pub fn fail(mut self, program: &str) -> RecordingRunner {
        self.failing.insert(program.to_string());
        self
    }

    /// Make `program` succeed without writing its outputs.
    pub fn without_outputs(mut self, program: &str) -> RecordingRunner {
        self.silent.insert(program.to_string());
        self
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// The program names run so far, in order.
    pub fn programs(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.program().to_string()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    fn materialize(output: &Output) -> Result<()> {
        if let Some(dir) = output.path.parent() {
            fs::create_dir_all(dir)?;
        }
        match output.kind {
            OutputKind::Matrix => {
                fs::write(&output.path, format_affine(&Array2::<f64>::eye(4)))?;
            }
            OutputKind::Image => {
                let mut file = ImageHandle::new(&output.path).stem_path().into_os_string();
                file.push(".nii.gz");
                write_empty_nifti(file)?;
            }
        }
        Ok(())
    }
}

impl ToolRunner for RecordingRunner {
    fn run(&self, command: &ToolCommand) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.clone());
        }
        if self.failing.contains(command.program()) {
            return Err(TransformError::tool_failure(
                command.command_line(),
                String::from("exit status: 1"),
                String::from("scripted failure"),
            ));
        }
        if !self.silent.contains(command.program()) {
            for out in command.outputs() {
                RecordingRunner::materialize(out)?;
            }
        }
        Ok(self.responses.get(command.program()).cloned().unwrap_or_default())
    }
}
