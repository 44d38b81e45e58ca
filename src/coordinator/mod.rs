//! Core loop glue between GDB, the editor and the handlers.
//!
//! Every piece of state shared by handlers lives in [`Context`] behind `RefCell`s. Handlers
//! are futures owned by the dispatcher, they keep an `Rc<Context>` and never hold a borrow
//! across an `await`.

pub mod awaiter;
pub mod dispatcher;
pub mod handlers;
pub mod session;
pub mod ui;

use crate::config::Config;
use crate::coordinator::awaiter::{RpcAwaiter, RpcQueue, RpcResult};
use crate::coordinator::dispatcher::Dispatcher;
use crate::coordinator::handlers::MiEvent;
use crate::coordinator::session::Session;
use crate::driver::breakpoint::BreakpointTable;
use crate::driver::editor::{EditorDriver, EditorEvent};
use crate::driver::gdb::GdbDriver;
use crate::driver::ssh::SshDriver;
use crate::error::Error;
use crate::parser::rpc_builder::RpcArg;
use crate::system::child_reaper::ChildReaper;
use crate::system::poll_table::PollTable;
use crate::{fatal, weak_error};
use nix::poll::PollFlags;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, UNIX_EPOCH};

/// State shared by the core loop and every handler.
pub struct Context {
    pub editor: RefCell<EditorDriver>,
    pub gdb: RefCell<GdbDriver>,
    pub session: RefCell<Session>,
    pub breakpoints: RefCell<BreakpointTable>,
    pub reaper: RefCell<ChildReaper>,
    pub ssh: Option<RefCell<SshDriver>>,
    pub dispatcher: Dispatcher,
    gdb_token: Cell<u32>,
}

impl Context {
    /// Send a request whose result nobody awaits.
    pub fn request(&self, method: &str, args: &[RpcArg]) -> u32 {
        self.editor.borrow_mut().send_rpc_request(method, args)
    }

    /// Send a request, the result is read when the returned awaiter resumes.
    pub fn promise<T: RpcResult>(&self, method: &str, args: &[RpcArg]) -> RpcAwaiter<'_, T> {
        let token = self.request(method, args);
        RpcAwaiter::new(&self.dispatcher, &self.editor, token)
    }

    pub fn rpc_queue<T: RpcResult>(&self) -> RpcQueue<'_, T> {
        RpcQueue::new(&self.dispatcher, &self.editor)
    }

    /// Submit an MI command under a fresh token.
    pub fn send_gdb(&self, command: &str) -> u32 {
        let token = self.gdb_token.get() + 1;
        self.gdb_token.set(token);
        weak_error!(self.gdb.borrow_mut().send(token, command), "gdb request:");
        token
    }

    /// Run a handler until its first suspension. Failures are logged, fatal ones abort.
    pub fn spawn<F>(&self, name: &'static str, handler: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        self.dispatcher.spawn(Box::pin(async move {
            if let Err(e) = handler.await {
                if e.is_fatal() {
                    fatal!("Handler {name}: {e}");
                }
                log::error!(target: "coordinator", "Handler {name} failed: {e}");
            }
        }));
    }
}

pub struct Coordinator {
    ctx: Rc<Context>,
    table: PollTable,
    editor_closed: bool,
    gdb_closed: bool,
}

impl Coordinator {
    /// Start GDB for `program` and talk to the editor through `editor_in`/`editor_out`.
    pub fn new(
        config: &Config,
        program: Option<&str>,
        editor_in: OwnedFd,
        editor_out: OwnedFd,
    ) -> Result<Self, Error> {
        let mut reaper = ChildReaper::new()?;
        let gdb = GdbDriver::start(&mut reaper, &config.gdb, program, config.write_timeout)?;
        Self::with_gdb(config, gdb, reaper, program, editor_in, editor_out)
    }

    /// Coordinator over an already running GDB driver.
    pub fn with_gdb(
        config: &Config,
        gdb: GdbDriver,
        reaper: ChildReaper,
        program: Option<&str>,
        editor_in: OwnedFd,
        editor_out: OwnedFd,
    ) -> Result<Self, Error> {
        let editor = EditorDriver::new(
            editor_in,
            editor_out,
            config.read_timeout,
            config.write_timeout,
        )?;
        let ssh = match config.host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => Some(RefCell::new(SshDriver::new(host)?)),
            None => None,
        };

        let ctx = Rc::new(Context {
            editor: RefCell::new(editor),
            gdb: RefCell::new(gdb),
            session: RefCell::new(Session::default()),
            breakpoints: RefCell::new(BreakpointTable::new()),
            reaper: RefCell::new(reaper),
            ssh,
            dispatcher: Dispatcher::new(),
            gdb_token: Cell::new(0),
        });

        handlers::initialize(&ctx);
        if let Some(program) = program {
            weak_error!(load_exe_timestamp(&ctx, program), "executable timestamp:");
        }

        Ok(Self {
            ctx,
            table: PollTable::new(),
            editor_closed: false,
            gdb_closed: false,
        })
    }

    pub fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    /// Both peers are still connected.
    pub fn is_running(&self) -> bool {
        !self.editor_closed && !self.gdb_closed
    }

    /// No handler waits for the editor and no helper runs.
    pub fn is_idle(&self) -> bool {
        let ssh_idle = self.ctx.ssh.as_ref().map_or(true, |ssh| ssh.borrow().is_idle());
        self.ctx.dispatcher.is_empty() && ssh_idle
    }

    pub fn print_activity(&self) {
        let ssh = self.ctx.ssh.as_ref().map(|ssh| {
            let ssh = ssh.borrow();
            (ssh.running_count(), ssh.queued_count())
        });
        log::info!(
            target: "coordinator",
            "Suspended handlers: {:?}, breakpoints: {}, ssh (running, queued): {:?}",
            self.ctx.dispatcher.suspended_tokens(),
            self.ctx.breakpoints.borrow().len(),
            ssh
        );
    }

    fn has_buffered(&self) -> bool {
        (!self.editor_closed && self.ctx.editor.borrow().has_buffered())
            || (!self.gdb_closed && self.ctx.gdb.borrow().has_buffered())
    }

    pub fn register_for_poll(&mut self) {
        self.table.reset();
        if !self.editor_closed {
            let fd = self.ctx.editor.borrow().as_raw_fd();
            self.table.register(fd, PollFlags::POLLIN);
        }
        if !self.gdb_closed {
            let fd = self.ctx.gdb.borrow().as_raw_fd();
            self.table.register(fd, PollFlags::POLLIN);
        }
        if let Some(ssh) = &self.ctx.ssh {
            ssh.borrow().register_for_poll(&mut self.table);
        }
    }

    pub fn on_poll_results(&mut self) -> Result<(), Error> {
        if !self.editor_closed {
            let fd = self.ctx.editor.borrow().as_raw_fd();
            let events = self.table.events(fd);
            if events.contains(PollFlags::POLLIN) || self.ctx.editor.borrow().has_buffered() {
                self.drain_editor()?;
            } else if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                log::warn!(target: "editor", "Editor closed the channel");
                self.editor_closed = true;
            }
        }

        if !self.gdb_closed {
            let fd = self.ctx.gdb.borrow().as_raw_fd();
            let events = self.table.events(fd);
            if events.contains(PollFlags::POLLIN) || self.ctx.gdb.borrow().has_buffered() {
                self.drain_gdb()?;
            } else if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                log::warn!(target: "gdb", "Gdb closed its output");
                self.gdb_closed = true;
            }
        }

        if let Some(ssh) = &self.ctx.ssh {
            ssh.borrow_mut()
                .on_poll_results(&self.table, &mut self.ctx.reaper.borrow_mut())?;
        }
        Ok(())
    }

    /// One loop iteration: wait for input, dispatch it, collect exited children.
    pub fn poll(&mut self, timeout: Duration) -> Result<(), Error> {
        let timeout = if self.has_buffered() {
            Duration::ZERO
        } else {
            timeout
        };
        self.register_for_poll();
        self.table.poll(timeout)?;
        self.on_poll_results()?;
        self.ctx.reaper.borrow_mut().reap();
        Ok(())
    }

    fn drain_editor(&mut self) -> Result<(), Error> {
        loop {
            let event = self.ctx.editor.borrow_mut().poll_event()?;
            match event {
                Some(EditorEvent::Response(token)) => {
                    if !self.ctx.dispatcher.resume(token) {
                        self.ctx.editor.borrow_mut().skip_result()?;
                    }
                }
                Some(EditorEvent::Notification(tree)) => {
                    handlers::handle_notification(&self.ctx, tree.rpc_view())
                }
                None => {}
            }
            if !self.ctx.editor.borrow().has_buffered() {
                return Ok(());
            }
        }
    }

    fn drain_gdb(&mut self) -> Result<(), Error> {
        loop {
            let event = self
                .ctx
                .gdb
                .borrow_mut()
                .poll_for_records()?
                .map(MiEvent::from);
            if let Some(event) = event {
                handlers::handle_gdb_event(&self.ctx, event);
            }
            if !self.ctx.gdb.borrow().has_buffered() {
                return Ok(());
            }
        }
    }

    /// Stop GDB, wait for every child and drop handlers that still wait for the editor.
    pub fn shutdown(&mut self) {
        self.ctx.gdb.borrow_mut().shutdown();
        self.ctx.reaper.borrow_mut().reap_all();
        self.ctx.dispatcher.clear();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // suspended handlers own the context
        self.ctx.dispatcher.clear();
    }
}

/// Shell single quoting for remote commands.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Remember when the executable was built, remotely through ssh when a host is set.
fn load_exe_timestamp(ctx: &Rc<Context>, program: &str) -> Result<(), Error> {
    let Some(ssh) = &ctx.ssh else {
        let modified = std::fs::metadata(program)?.modified()?;
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        ctx.session.borrow_mut().set_exe_timestamp(secs);
        return Ok(());
    };

    let weak: Weak<Context> = Rc::downgrade(ctx);
    let command = format!("stat -c %Y {}", shell_quote(program));
    ssh.borrow_mut().submit(
        &mut ctx.reaper.borrow_mut(),
        &command,
        Box::new(move |out: String| {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            match out.trim().parse::<i64>() {
                Ok(secs) if !ctx.session.borrow().has_exe_timestamp() => {
                    ctx.session.borrow_mut().set_exe_timestamp(secs)
                }
                Ok(_) => {}
                Err(e) => log::warn!(target: "ssh", "Bad stat output {out:?}: {e}"),
            }
        }),
    )
}
