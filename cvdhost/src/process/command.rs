//! Command builder and fork/exec.
//!
//! A [`Command`] describes an executable, its argv, environment, stdio
//! redirects, inherited descriptors and working directory. It is immutable
//! once built and may be started any number of times; every start produces an
//! independent [`Subprocess`].

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr};
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{ForkResult, fork};

use cvdhost_shared::errors::{CvdResult, ErrorKind, StackTraceError};
use cvdhost_shared::{ensure, errno_err, propagate, stack_entry, stack_err};

use super::stopper::{Stopper, kill_subprocess};
use super::subprocess::Subprocess;
use crate::fd::ScopedFd;

/// Exit status of a child whose `execve` failed.
pub const EXEC_FAILED_STATUS: i32 = 127;
/// Exit status of a child that failed to set itself up before `execve`.
pub const CHILD_SETUP_FAILED_STATUS: i32 = 126;

/// Lowest descriptor number handed out for inherited descriptors.
const FIRST_INHERITED_FD: RawFd = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StdIoChannel {
    StdIn,
    StdOut,
    StdErr,
}

impl StdIoChannel {
    pub fn fd_number(self) -> RawFd {
        match self {
            StdIoChannel::StdIn => 0,
            StdIoChannel::StdOut => 1,
            StdIoChannel::StdErr => 2,
        }
    }
}

#[derive(Clone)]
enum Redirect {
    Fd(Arc<ScopedFd>),
    Channel(StdIoChannel),
}

#[derive(Clone)]
enum WorkingDirectory {
    Path(PathBuf),
    Fd(Arc<ScopedFd>),
}

/// Per-start options.
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    pub(crate) verbose: bool,
    pub(crate) exit_with_parent: bool,
    pub(crate) in_group: bool,
    pub(crate) strace: Option<PathBuf>,
}

impl Default for SubprocessOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            exit_with_parent: true,
            in_group: false,
            strace: None,
        }
    }
}

impl SubprocessOptions {
    /// Log the full argv at debug level when starting.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ask the kernel to send `SIGHUP` to the child when the parent dies.
    pub fn exit_with_parent(mut self, exit_with_parent: bool) -> Self {
        self.exit_with_parent = exit_with_parent;
        self
    }

    /// Make the child the leader of a new session and process group.
    pub fn in_group(mut self, in_group: bool) -> Self {
        self.in_group = in_group;
        self
    }

    /// Run the command under `strace`, writing traces next to `output`.
    pub fn strace(mut self, output: impl Into<PathBuf>) -> Self {
        self.strace = Some(output.into());
        self
    }
}

/// Builder for a process to spawn.
///
/// Builder methods take and return `self`. Failures while building (such as a
/// descriptor that cannot be duplicated) are remembered and reported by
/// [`start`](Command::start).
#[derive(Clone)]
pub struct Command {
    executable: PathBuf,
    arguments: Vec<String>,
    environment: Vec<String>,
    redirects: BTreeMap<StdIoChannel, Redirect>,
    inherited: Vec<(Arc<ScopedFd>, RawFd)>,
    working_directory: Option<WorkingDirectory>,
    stopper: Stopper,
    pending_error: Option<StackTraceError>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("executable", &self.executable)
            .field("arguments", &self.arguments)
            .finish()
    }
}

impl Command {
    /// A command running `executable`, with argv[0] set to it and the
    /// current process environment.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let environment = std::env::vars_os()
            .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
            .collect();
        Self {
            arguments: vec![executable.to_string_lossy().into_owned()],
            executable,
            environment,
            redirects: BTreeMap::new(),
            inherited: Vec::new(),
            working_directory: None,
            stopper: Arc::new(kill_subprocess),
            pending_error: None,
        }
    }

    pub fn set_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Set argv[0].
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.arguments[0] = name.into();
        self
    }

    pub fn set_stopper<F>(mut self, stopper: F) -> Self
    where
        F: Fn(&mut Subprocess) -> super::StopperResult + Send + Sync + 'static,
    {
        self.stopper = Arc::new(stopper);
        self
    }

    pub fn set_shared_stopper(mut self, stopper: Stopper) -> Self {
        self.stopper = stopper;
        self
    }

    /// Replace the whole environment with `KEY=VALUE` entries.
    pub fn set_environment<I, S>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment = environment.into_iter().map(Into::into).collect();
        self
    }

    /// Append `key=value`. Existing entries for `key` are kept.
    pub fn add_environment_variable(mut self, key: impl fmt::Display, value: impl fmt::Display) -> Self {
        self.environment.push(format!("{}={}", key, value));
        self
    }

    /// Remove every `key=...` entry.
    pub fn unset_from_environment(mut self, key: &str) -> Self {
        let prefix = format!("{}=", key);
        self.environment.retain(|entry| !entry.starts_with(&prefix));
        self
    }

    pub fn add_parameter(mut self, parameter: impl fmt::Display) -> Self {
        self.arguments.push(parameter.to_string());
        self
    }

    pub fn add_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        self.arguments
            .extend(parameters.into_iter().map(|p| p.to_string()));
        self
    }

    /// Add `prefix` followed by the child-side number of a duplicate of `fd`.
    pub fn add_fd_parameter(mut self, prefix: impl fmt::Display, fd: &ScopedFd) -> Self {
        match self.inherit(fd, None) {
            Ok(number) => self.arguments.push(format!("{}{}", prefix, number)),
            Err(err) => self.remember(err),
        }
        self
    }

    pub fn append_to_last_parameter(mut self, text: impl fmt::Display) -> Self {
        if let Some(last) = self.arguments.last_mut() {
            last.push_str(&text.to_string());
        }
        self
    }

    /// Append the child-side number of a duplicate of `fd` to the last argv entry.
    pub fn append_fd_to_last_parameter(mut self, fd: &ScopedFd) -> Self {
        match self.inherit(fd, None) {
            Ok(number) => {
                if let Some(last) = self.arguments.last_mut() {
                    last.push_str(&number.to_string());
                }
            }
            Err(err) => self.remember(err),
        }
        self
    }

    /// Make a duplicate of `fd` available in the child as descriptor `target`.
    pub fn inherit_fd_as(mut self, fd: &ScopedFd, target: RawFd) -> Self {
        if let Err(err) = self.inherit(fd, Some(target)) {
            self.remember(err);
        }
        self
    }

    /// Point the child's `channel` at `fd`.
    pub fn redirect_stdio(mut self, channel: StdIoChannel, fd: impl Into<Arc<ScopedFd>>) -> Self {
        let fd = fd.into();
        if !fd.is_open() {
            self.remember(stack_err!(
                kind = ErrorKind::Config,
                "redirect of {:?} to a closed descriptor",
                channel
            ));
            return self;
        }
        self.redirects.insert(channel, Redirect::Fd(fd));
        self
    }

    /// Point the child's `channel` at whatever its `source` channel refers to.
    pub fn redirect_stdio_to_channel(mut self, channel: StdIoChannel, source: StdIoChannel) -> Self {
        self.redirects.insert(channel, Redirect::Channel(source));
        self
    }

    pub fn set_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(WorkingDirectory::Path(path.into()));
        self
    }

    pub fn set_working_directory_fd(mut self, dirfd: impl Into<Arc<ScopedFd>>) -> Self {
        self.working_directory = Some(WorkingDirectory::Fd(dirfd.into()));
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// argv, including argv[0].
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &[String] {
        &self.environment
    }

    /// Basename of the executable, used in logs.
    /// Basename of argv[0], which `set_name` may have replaced.
    pub fn process_name(&self) -> String {
        let argv0 = self.arguments.first().map(String::as_str).unwrap_or_default();
        match Path::new(argv0).file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.short_name(),
        }
    }

    pub fn short_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.to_string_lossy().into_owned())
    }

    pub fn stopper(&self) -> Stopper {
        Arc::clone(&self.stopper)
    }

    fn remember(&mut self, err: StackTraceError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
    }

    fn inherit(&mut self, fd: &ScopedFd, target: Option<RawFd>) -> CvdResult<RawFd> {
        ensure!(fd.is_open(), kind = ErrorKind::Config, "cannot pass a closed descriptor");
        let copy = propagate!(fd.dup_at_least(FIRST_INHERITED_FD), "duplicating fd {}", fd.raw());
        let number = target.unwrap_or(copy.raw());
        self.inherited.push((Arc::new(copy), number));
        Ok(number)
    }

    /// Spawn the command.
    ///
    /// # Errors
    /// Building errors recorded earlier, invalid redirect plans, executables
    /// not found on `PATH`, strings with interior NULs, or a failed `fork`.
    /// A failed `execve` is reported through the child's exit status
    /// ([`EXEC_FAILED_STATUS`]).
    pub fn start(&self, options: SubprocessOptions) -> CvdResult<Subprocess> {
        if let Some(err) = &self.pending_error {
            return Err(err.clone().push_entry(stack_entry!()));
        }
        propagate!(self.validate_redirects());

        let (executable, arguments) = propagate!(self.resolved_argv(&options));
        let mut plan = propagate!(ChildPlan::build(self, &executable, &arguments, &options));

        if options.verbose {
            tracing::debug!(
                command = %self.short_name(),
                executable = %executable.display(),
                args = ?arguments,
                "Starting subprocess"
            );
        }

        // SAFETY: the child only runs async-signal-safe calls from `exec_child`
        // on memory prepared before the fork.
        let pid = match propagate!(unsafe { fork() }, "fork failed for {}", self.short_name()) {
            ForkResult::Parent { child } => child.as_raw(),
            // SAFETY: we are the freshly forked child.
            ForkResult::Child => unsafe { plan.exec_child() },
        };

        tracing::trace!(command = %self.short_name(), pid, "Subprocess started");
        Ok(Subprocess::new(
            pid,
            self.process_name(),
            options.in_group,
            Arc::clone(&self.stopper),
        ))
    }

    fn validate_redirects(&self) -> CvdResult<()> {
        let mut targets = std::collections::HashSet::new();
        for (_, target) in &self.inherited {
            ensure!(
                *target >= 0,
                kind = ErrorKind::Config,
                "inherited fd target {} is negative",
                target
            );
            ensure!(
                targets.insert(*target),
                kind = ErrorKind::Config,
                "fd {} is inherited twice",
                target
            );
            for channel in self.redirects.keys() {
                ensure!(
                    channel.fd_number() != *target,
                    kind = ErrorKind::Config,
                    "inherited fd {} collides with redirected {:?}",
                    target,
                    channel
                );
            }
        }
        for (channel, redirect) in &self.redirects {
            if let Redirect::Channel(source) = redirect {
                ensure!(
                    source != channel,
                    kind = ErrorKind::Config,
                    "{:?} redirected to itself",
                    channel
                );
            }
        }
        Ok(())
    }

    fn resolved_argv(&self, options: &SubprocessOptions) -> CvdResult<(PathBuf, Vec<String>)> {
        let executable = propagate!(self.resolve_executable(&self.executable));
        let Some(output) = &options.strace else {
            return Ok((executable, self.arguments.clone()));
        };
        let strace = propagate!(self.resolve_executable(Path::new("strace")));
        let mut arguments = vec![
            "strace".to_string(),
            "--daemonize".to_string(),
            "--output-separately".to_string(),
            "--follow-forks".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            executable.to_string_lossy().into_owned(),
        ];
        arguments.extend(self.arguments.iter().skip(1).cloned());
        Ok((strace, arguments))
    }

    /// Resolve a bare program name against this command's `PATH`.
    fn resolve_executable(&self, executable: &Path) -> CvdResult<PathBuf> {
        if executable.as_os_str().as_bytes().contains(&b'/') {
            return Ok(executable.to_path_buf());
        }
        let path_var = self
            .environment
            .iter()
            .rev()
            .find_map(|entry| entry.strip_prefix("PATH="))
            .map(str::to_string)
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        for dir in path_var.split(':').filter(|dir| !dir.is_empty()) {
            let candidate = Path::new(dir).join(executable);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
        Err(stack_err!(
            kind = ErrorKind::Config,
            "{} not found on PATH",
            executable.display()
        ))
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn to_cstring(text: &OsStr) -> CvdResult<CString> {
    CString::new(text.as_bytes()).map_err(|_| {
        stack_err!(
            kind = ErrorKind::Config,
            "interior NUL in {:?}",
            text.to_string_lossy()
        )
    })
}

/// Everything the child needs, prepared before `fork` so the child never
/// allocates.
struct ChildPlan {
    executable: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    /// Parent descriptors to copy above `floor` first.
    sources: Vec<RawFd>,
    moved: Vec<RawFd>,
    floor: RawFd,
    stdio_fds: Vec<(usize, RawFd)>,
    stdio_channels: Vec<(RawFd, RawFd)>,
    inherited: Vec<(usize, RawFd)>,
    keep: Vec<RawFd>,
    chdir: Option<CString>,
    fchdir: Option<usize>,
    parent_pid: libc::pid_t,
    exit_with_parent: bool,
    in_group: bool,
    max_fd: RawFd,
}

impl ChildPlan {
    fn build(
        command: &Command,
        executable: &Path,
        arguments: &[String],
        options: &SubprocessOptions,
    ) -> CvdResult<Self> {
        let executable = propagate!(to_cstring(executable.as_os_str()));
        let mut argv = Vec::with_capacity(arguments.len());
        for arg in arguments {
            argv.push(propagate!(to_cstring(OsStr::new(arg))));
        }
        let mut envp = Vec::with_capacity(command.environment.len());
        for entry in &command.environment {
            envp.push(propagate!(to_cstring(OsStr::new(entry))));
        }
        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs = envp
            .iter()
            .map(|entry| entry.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut sources = Vec::new();
        let mut stdio_fds = Vec::new();
        let mut stdio_channels = Vec::new();
        for (channel, redirect) in &command.redirects {
            match redirect {
                Redirect::Fd(fd) => {
                    stdio_fds.push((sources.len(), channel.fd_number()));
                    sources.push(fd.raw());
                }
                Redirect::Channel(source) => {
                    stdio_channels.push((source.fd_number(), channel.fd_number()));
                }
            }
        }
        let mut inherited = Vec::new();
        for (fd, target) in &command.inherited {
            inherited.push((sources.len(), *target));
            sources.push(fd.raw());
        }
        let (chdir, fchdir) = match &command.working_directory {
            Some(WorkingDirectory::Path(path)) => {
                (Some(propagate!(to_cstring(path.as_os_str()))), None)
            }
            Some(WorkingDirectory::Fd(fd)) => {
                let index = sources.len();
                sources.push(fd.raw());
                (None, Some(index))
            }
            None => (None, None),
        };

        let mut keep: Vec<RawFd> = inherited
            .iter()
            .map(|(_, target)| *target)
            .filter(|target| *target >= FIRST_INHERITED_FD)
            .collect();
        keep.sort_unstable();
        let floor = keep.last().map_or(FIRST_INHERITED_FD, |max| max + 1).max(64);

        let max_fd = propagate!(max_open_fds());
        Ok(Self {
            executable,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            moved: vec![-1; sources.len()],
            sources,
            floor,
            stdio_fds,
            stdio_channels,
            inherited,
            keep,
            chdir,
            fchdir,
            // SAFETY: getpid cannot fail.
            parent_pid: unsafe { libc::getpid() },
            exit_with_parent: options.exit_with_parent,
            in_group: options.in_group,
            max_fd,
        })
    }

    /// Child half of `start`. Never returns.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child.
    unsafe fn exec_child(&mut self) -> ! {
        // SAFETY: only async-signal-safe libc calls on pre-built data.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());

            if self.exit_with_parent {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP as libc::c_ulong);
                if libc::getppid() != self.parent_pid {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            }
            if self.in_group && libc::setsid() < 0 {
                libc::_exit(CHILD_SETUP_FAILED_STATUS);
            }

            for (index, source) in self.sources.iter().enumerate() {
                let moved = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, self.floor);
                if moved < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
                self.moved[index] = moved;
            }
            for (index, target) in &self.stdio_fds {
                if libc::dup2(self.moved[*index], *target) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            }
            for (from, to) in &self.stdio_channels {
                if libc::dup2(*from, *to) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            }
            for (index, target) in &self.inherited {
                if libc::dup2(self.moved[*index], *target) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            }

            if let Some(index) = self.fchdir {
                if libc::fchdir(self.moved[index]) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            } else if let Some(path) = &self.chdir {
                if libc::chdir(path.as_ptr()) < 0 {
                    libc::_exit(CHILD_SETUP_FAILED_STATUS);
                }
            }

            self.close_others();
            libc::execve(
                self.executable.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            libc::_exit(EXEC_FAILED_STATUS);
        }
    }

    /// Close every descriptor above stderr except the inherited targets.
    unsafe fn close_others(&self) {
        let mut low = FIRST_INHERITED_FD;
        for keep in &self.keep {
            if *keep > low {
                // SAFETY: closing descriptors in the child only.
                unsafe { self.close_range(low, keep - 1) };
            }
            low = keep + 1;
        }
        // SAFETY: as above.
        unsafe { self.close_range(low, RawFd::MAX) };
    }

    unsafe fn close_range(&self, low: RawFd, high: RawFd) {
        // SAFETY: close_range(2) with valid bounds; fallback closes one by one.
        unsafe {
            let rc = libc::syscall(
                libc::SYS_close_range,
                low as libc::c_uint,
                high as libc::c_uint,
                0 as libc::c_uint,
            );
            if rc == 0 {
                return;
            }
            let mut fd = low;
            while fd <= high && fd < self.max_fd {
                libc::close(fd);
                fd += 1;
            }
        }
    }
}

fn max_open_fds() -> CvdResult<RawFd> {
    // SAFETY: rlimit is plain data.
    let mut limit: libc::rlimit = unsafe { std::mem::zeroed() };
    // SAFETY: limit is a valid out-param.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } < 0 {
        return Err(errno_err!("getrlimit(RLIMIT_NOFILE) failed"));
    }
    Ok(limit.rlim_cur.min(1 << 20) as RawFd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::run_with_managed_stdio;

    fn capture(command: Command) -> (i32, String) {
        let mut out = Vec::new();
        let code = run_with_managed_stdio(command, None, Some(&mut out), None);
        (code, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_argv_zero_defaults_to_executable() {
        let command = Command::new("/bin/echo").add_parameter("hi");
        assert_eq!(command.arguments(), &["/bin/echo".to_string(), "hi".to_string()]);
        assert_eq!(command.short_name(), "echo");
    }

    #[test]
    fn test_set_name_changes_argv_zero() {
        let (code, out) = capture(
            Command::new("/bin/sh")
                .set_name("custom-name")
                .add_parameters(["-c", "echo $0"]),
        );
        assert_eq!(code, 0);
        assert_eq!(out, "custom-name\n");
    }

    #[test]
    fn test_subprocess_takes_configured_name() {
        let mut named = Command::new("/bin/true")
            .set_name("launcher-true")
            .start(SubprocessOptions::default())
            .unwrap();
        assert_eq!(named.name(), "launcher-true");
        named.wait().unwrap();

        let mut plain = Command::new("/bin/true").start(SubprocessOptions::default()).unwrap();
        assert_eq!(plain.name(), "true");
        plain.wait().unwrap();
    }

    #[test]
    fn test_environment_edits() {
        let command = Command::new("/bin/true")
            .set_environment(["A=1", "AB=2", "B=3"])
            .add_environment_variable("A", "4")
            .unset_from_environment("A");
        assert_eq!(command.environment(), &["AB=2".to_string(), "B=3".to_string()]);
    }

    #[test]
    fn test_environment_reaches_child() {
        let (code, out) = capture(
            Command::new("/bin/sh")
                .set_environment(["PATH=/usr/bin:/bin"])
                .add_environment_variable("CVD_GREETING", "hello")
                .add_parameters(["-c", "echo $CVD_GREETING"]),
        );
        assert_eq!(code, 0);
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_append_to_last_parameter() {
        let command = Command::new("/bin/true")
            .add_parameter("--port=")
            .append_to_last_parameter(6520);
        assert_eq!(command.arguments()[1], "--port=6520");
    }

    #[test]
    fn test_fd_parameter_is_inherited() {
        let (read, write) = ScopedFd::pipe().unwrap();
        let command = Command::new("/bin/sh")
            .add_parameter("-c")
            .add_parameter("echo inherited >&$0")
            .add_fd_parameter("", &write);
        drop(write);
        let number: RawFd = command.arguments()[3].parse().unwrap();
        assert!(number >= 3);
        let mut process = command.start(SubprocessOptions::default()).unwrap();
        drop(command);
        assert_eq!(process.wait().unwrap(), 0);
        let mut buf = [0u8; 32];
        let n = read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"inherited\n");
    }

    #[test]
    fn test_inherit_fd_as_specific_number() {
        let (read, write) = ScopedFd::pipe().unwrap();
        let command = Command::new("/bin/sh")
            .add_parameters(["-c", "echo nine >&9"])
            .inherit_fd_as(&write, 9);
        drop(write);
        let mut process = command.start(SubprocessOptions::default()).unwrap();
        drop(command);
        assert_eq!(process.wait().unwrap(), 0);
        let mut buf = [0u8; 16];
        let n = read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"nine\n");
    }

    #[test]
    fn test_other_fds_are_closed_in_child() {
        let (_read, write) = ScopedFd::pipe().unwrap();
        write.set_cloexec(false).unwrap();
        let script = format!("[ -e /proc/self/fd/{} ] && echo open || echo closed", write.raw());
        let (code, out) = capture(Command::new("/bin/sh").add_parameters(["-c", script.as_str()]));
        assert_eq!(code, 0);
        assert_eq!(out, "closed\n");
    }

    #[test]
    fn test_redirect_channel_to_channel() {
        let (code, out) = capture(
            Command::new("/bin/sh")
                .add_parameters(["-c", "echo oops >&2"])
                .redirect_stdio_to_channel(StdIoChannel::StdErr, StdIoChannel::StdOut),
        );
        assert_eq!(code, 0);
        assert_eq!(out, "oops\n");
    }

    #[test]
    fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let (code, out) = capture(Command::new("/bin/pwd").set_working_directory(&canonical));
        assert_eq!(code, 0);
        assert_eq!(out.trim_end(), canonical.to_str().unwrap());
    }

    #[test]
    fn test_working_directory_fd() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let dirfd = ScopedFd::open(&canonical, nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_DIRECTORY, 0)
            .unwrap();
        let (code, out) = capture(Command::new("/bin/pwd").set_working_directory_fd(dirfd));
        assert_eq!(code, 0);
        assert_eq!(out.trim_end(), canonical.to_str().unwrap());
    }

    #[test]
    fn test_path_resolution() {
        let command = Command::new("sh").set_environment(["PATH=/nonexistent:/bin:/usr/bin"]);
        let (code, out) = capture(command.add_parameters(["-c", "echo found"]));
        assert_eq!(code, 0);
        assert_eq!(out, "found\n");
    }

    #[test]
    fn test_missing_program_is_config_error() {
        let command = Command::new("definitely-not-a-cvd-binary").set_environment(["PATH=/nonexistent"]);
        let err = command.start(SubprocessOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_exec_failure_exit_status() {
        let mut process = Command::new("/nonexistent/cvd/binary")
            .start(SubprocessOptions::default())
            .unwrap();
        assert_eq!(process.wait().unwrap(), EXEC_FAILED_STATUS);
    }

    #[test]
    fn test_inherited_fd_colliding_with_redirect_rejected() {
        let (_read, write) = ScopedFd::pipe().unwrap();
        let out = Arc::new(write.dup().unwrap());
        let command = Command::new("/bin/true")
            .redirect_stdio(StdIoChannel::StdOut, out)
            .inherit_fd_as(&write, 1);
        let err = command.start(SubprocessOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_closed_redirect_reported_at_start() {
        let command = Command::new("/bin/true").redirect_stdio(StdIoChannel::StdOut, ScopedFd::empty());
        let err = command.start(SubprocessOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_two_starts_have_distinct_pids() {
        let command = Command::new("/bin/true");
        let mut a = command.start(SubprocessOptions::default()).unwrap();
        let mut b = command.start(SubprocessOptions::default()).unwrap();
        assert_ne!(a.pid(), b.pid());
        assert_eq!(a.wait().unwrap(), 0);
        assert_eq!(b.wait().unwrap(), 0);
    }

    #[test]
    fn test_strace_prefix() {
        let command = Command::new("/bin/true").set_environment(["PATH=/nonexistent"]);
        let err = command
            .start(SubprocessOptions::default().strace("/tmp/trace"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
