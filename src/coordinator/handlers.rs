//! Reactions to GDB records and editor notifications.

use crate::coordinator::session::{BufferSlot, Namespace};
use crate::coordinator::ui::{Message, HL_NORMAL};
use crate::coordinator::Context;
use crate::driver::breakpoint::{Breakpoint, BreakpointType};
use crate::driver::gdb::{AsyncKind, GdbRecord, ResultKind, StreamKind};
use crate::error::Error;
use crate::expr::view::{GdbExprView, RpcExprView};
use crate::expr::ExprTree;
use crate::io::descriptor::file_readable;
use crate::log::log_multiline;
use crate::parser::mi::parse_mi;
use crate::parser::rpc_builder::RpcArg;
use log::Level;
use std::path::Path;
use std::rc::Rc;
use strum::IntoEnumIterator;

/// GDB record detached from the driver read buffer.
#[derive(Debug)]
pub enum MiEvent {
    Stream {
        kind: StreamKind,
        text: String,
    },
    Async {
        token: u32,
        kind: AsyncKind,
        results: Option<ExprTree>,
    },
    Result {
        token: u32,
        kind: ResultKind,
        results: Option<ExprTree>,
    },
}

impl From<GdbRecord<'_>> for MiEvent {
    fn from(record: GdbRecord<'_>) -> Self {
        match record {
            GdbRecord::Stream { kind, message } => MiEvent::Stream {
                kind,
                text: String::from_utf8_lossy(message).into_owned(),
            },
            GdbRecord::Async {
                token,
                kind,
                results,
            } => MiEvent::Async {
                token,
                kind,
                results: parse_mi(results),
            },
            GdbRecord::Result {
                token,
                kind,
                results,
            } => MiEvent::Result {
                token,
                kind,
                results: parse_mi(results),
            },
        }
    }
}

fn view(tree: &Option<ExprTree>) -> GdbExprView<'_> {
    tree.as_ref().map_or_else(GdbExprView::null, ExprTree::gdb_view)
}

pub fn handle_gdb_event(ctx: &Rc<Context>, event: MiEvent) {
    match event {
        MiEvent::Stream { kind, text } => handle_stream(ctx, kind, &text),
        MiEvent::Async {
            token,
            kind,
            results,
        } => handle_async(ctx, token, kind, view(&results)),
        MiEvent::Result {
            token,
            kind,
            results,
        } => handle_result(ctx, token, kind, view(&results)),
    }
}

fn handle_stream(ctx: &Context, kind: StreamKind, text: &str) {
    match kind {
        StreamKind::Console => ctx.show_normal(text),
        StreamKind::Target | StreamKind::Log => {
            log_multiline("gdb", Level::Info, text.as_bytes())
        }
    }
}

fn handle_async(ctx: &Rc<Context>, token: u32, kind: AsyncKind, results: GdbExprView) {
    match kind {
        AsyncKind::BreakpointCreated => new_breakpoint(ctx, results.get("bkpt"), true),
        AsyncKind::BreakpointModified => new_breakpoint(ctx, results.get("bkpt"), false),
        AsyncKind::BreakpointDeleted => {
            let id = results.get("id").require_str().to_string();
            ctx.spawn("clear breakpoint", clear_breakpoint_sign(ctx.clone(), id, true));
        }
        AsyncKind::ThreadSelected => {
            let thread = results.get("id");
            let thread = if thread.is_some() {
                thread
            } else {
                results.get("new-thread-id")
            };
            let mut session = ctx.session.borrow_mut();
            session.selected_thread = thread.require_int();
            session.selected_frame = results.get("frame").get("level").number_or(0);
        }
        AsyncKind::Stopped => {
            let reason = results.get("reason").str_or("");
            let mut session = ctx.session.borrow_mut();
            session.is_stopped = true;
            if let Some(thread) = results.get("thread-id").as_int() {
                session.selected_thread = thread;
            }
            session.selected_frame = results.get("frame").get("level").number_or(0);
            if reason.starts_with("exited") {
                log::info!(target: "coordinator", "Inferior {} ({reason})", session.pid);
                session.pid = -1;
            }
        }
        AsyncKind::Running => ctx.session.borrow_mut().is_stopped = false,
        AsyncKind::ThreadGroupStarted => {
            ctx.session.borrow_mut().pid = results.get("pid").require_int();
        }
        AsyncKind::CmdParamChanged
        | AsyncKind::LibraryLoaded
        | AsyncKind::LibraryUnloaded
        | AsyncKind::ThreadCreated
        | AsyncKind::ThreadExited => {
            log::debug!(target: "gdb", "{kind} ({token}): {results}");
        }
        AsyncKind::Unknown => log::info!(target: "gdb", "Unknown async record: {results}"),
    }
}

fn handle_result(ctx: &Context, token: u32, kind: ResultKind, results: GdbExprView) {
    match kind {
        ResultKind::Error => ctx.show_error(results.get("msg").str_or("Unknown error")),
        ResultKind::Done => log::debug!(target: "gdb", "Done ({token}): {results}"),
        ResultKind::Unknown => log::info!(target: "gdb", "Unknown result ({token}): {results}"),
    }
}

/// Text of a console command quoted as an MI c-string.
fn mi_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// File name as an Ex command argument, the characters Vim expands or splits on are escaped.
fn escape_file_arg(path: &str) -> String {
    const SPECIAL: &[char] = &[
        ' ', '\t', '%', '#', '|', '"', '\\', '*', '?', '[', '{', '$', '<', '!', '\'', '`',
    ];
    let mut escaped = String::with_capacity(path.len() + 8);
    for (i, c) in path.chars().enumerate() {
        if SPECIAL.contains(&c) || (i == 0 && (c == '+' || c == '>')) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn handle_notification(ctx: &Rc<Context>, msg: RpcExprView) {
    let method = msg.at(1).require_str();
    let params = msg.at(2);
    log::debug!(target: "editor", "Notification {method}: {params}");
    match method {
        "pdp/buf_changed" => {
            let bufnr = params.at(0).require_int();
            let name = params.at(1).require_str();
            if Path::new(name).is_absolute() && file_readable(name) {
                ctx.session
                    .borrow_mut()
                    .opened_buffers
                    .insert(name.to_string(), bufnr);
                place_file_signs(ctx, name);
            }
        }
        "pdp/buf_removed" => {
            let name = params.at(0).require_str();
            ctx.session.borrow_mut().opened_buffers.shift_remove(name);
        }
        "pdp/command" => {
            let text = params.at(0).require_str();
            ctx.send_gdb(&format!("-interpreter-exec console {}", mi_quote(text)));
        }
        "pdp/mi" => {
            ctx.send_gdb(params.at(0).require_str());
        }
        "pdp/jump" => {
            let line = params.at(0).require_int();
            let jump = ctx.session.borrow().jumps.find(line).cloned();
            match jump {
                Some(jump) => {
                    let command = format!("edit +{} {}", jump.lnum, escape_file_arg(&jump.file));
                    ctx.request("nvim_command", &[RpcArg::Str(&command)]);
                }
                None => log::debug!(target: "editor", "No jump on prompt line {line}"),
            }
        }
        _ => log::warn!(target: "editor", "Unknown notification {method}"),
    }
}

/// Spawn the handlers that prepare editor namespaces and buffers.
pub fn initialize(ctx: &Rc<Context>) {
    ctx.spawn("initialize namespaces", initialize_namespaces(ctx.clone()));
    ctx.spawn("initialize buffers", initialize_buffers(ctx.clone()));
}

async fn initialize_namespaces(ctx: Rc<Context>) -> Result<(), Error> {
    let mut queue = ctx.rpc_queue::<i64>();
    for ns in Namespace::iter() {
        queue.push(ctx.promise_namespace(ns.name()));
    }
    for ns in Namespace::iter() {
        let Some(awaiter) = queue.next() else {
            break;
        };
        let id = awaiter.await?;
        ctx.session.borrow_mut().set_namespace(ns, id);
    }
    Ok(())
}

async fn initialize_buffers(ctx: Rc<Context>) -> Result<(), Error> {
    let buffers = ctx.promise_buffer_list().await?;
    let mut names = ctx.rpc_queue::<String>();
    for &bufnr in &buffers {
        names.push(ctx.promise_buffer_name(bufnr));
    }
    for &bufnr in &buffers {
        let Some(awaiter) = names.next() else {
            break;
        };
        let name = awaiter.await?;
        let mut session = ctx.session.borrow_mut();
        match BufferSlot::matching(&name) {
            Some(slot) => session.set_buffer(slot, bufnr),
            None if Path::new(&name).is_absolute() && file_readable(&name) => {
                session.opened_buffers.insert(name, bufnr);
            }
            None => {}
        }
    }

    for slot in BufferSlot::iter() {
        if ctx.session.borrow().buffer(slot) >= 0 {
            continue;
        }
        let bufnr = ctx.promise_create_buffer().await?;
        ctx.set_buffer_name(bufnr, slot.name());
        ctx.session.borrow_mut().set_buffer(slot, bufnr);
    }
    ctx.reset_prompt_buffer();
    log::info!(target: "coordinator", "Editor buffers ready");
    Ok(())
}

fn new_breakpoint(ctx: &Rc<Context>, bkpt: GdbExprView, created: bool) {
    let id = bkpt.get("number").require_str();
    let kind = BreakpointType::from_mi(bkpt.get("type").str_or(""));
    if kind != BreakpointType::Break {
        let what = bkpt.get("what").str_or("?");
        match kind {
            _ if !created => {}
            BreakpointType::Catch => ctx.show_normal(&format!("Catchpoint {id} ({what})")),
            k if k.is_watchpoint() => ctx.show_normal(&format!("Watchpoint {id} ({what})")),
            _ => log::debug!(target: "coordinator", "Ignoring breakpoint {id} of kind {kind}"),
        }
        return;
    }
    if let Some(pending) = bkpt.get("pending").as_str() {
        if created {
            ctx.show_normal(&format!("Breakpoint {id} ({pending}) pending"));
        }
        return;
    }

    ctx.spawn(
        "clear breakpoint sign",
        clear_breakpoint_sign(ctx.clone(), id.to_string(), false),
    );

    let inferior_running = ctx.session.borrow().pid > 0;
    let locations: Vec<(GdbExprView, Option<GdbExprView>)> = if bkpt.get("addr") == "<MULTIPLE>" {
        ctx.breakpoints.borrow_mut().insert(bkpt, None);
        bkpt.get("locations").iter().map(|l| (l, Some(bkpt))).collect()
    } else {
        vec![(bkpt, None)]
    };

    for (location, parent) in locations {
        let (id, is_new) = ctx.breakpoints.borrow_mut().insert(location, parent);
        let br = ctx.breakpoints.borrow().find(&id).cloned();
        let Some(br) = br else {
            continue;
        };
        if br.kind == BreakpointType::Break {
            ctx.spawn(
                "place breakpoint sign",
                place_breakpoint_sign(ctx.clone(), id.clone()),
            );
        }
        if is_new && inferior_running {
            format_breakpoint_message(ctx, location, &id, &br);
        }
    }
}

/// Show a breakpoint in the prompt buffer, jumpable when its source is readable.
fn format_breakpoint_message(ctx: &Context, bkpt: GdbExprView, id: &str, br: &Breakpoint) {
    let mut jumpable = false;
    let mut message = Message::new();
    message.push("debugIdentifier", format_args!("*{id}"));

    if br.kind.is_watchpoint() {
        let access = match br.kind {
            BreakpointType::WatchRead => " is read",
            BreakpointType::Watch => " is written",
            _ => " is accessed",
        };
        message
            .push(HL_NORMAL, " when ")
            .push("Bold", format_args!("\"{}\"", bkpt.get("what").require_str()))
            .push(HL_NORMAL, access);
    } else if br.kind == BreakpointType::Catch {
        message
            .push(HL_NORMAL, " ")
            .push("Bold", format_args!("\"{}\"", bkpt.get("what").require_str()));
    } else if br.kind == BreakpointType::Break {
        jumpable = !br.fullname.is_empty() && file_readable(&br.fullname);
        let hl = if jumpable && br.enabled {
            "debugJumpable"
        } else {
            "debugLocation"
        };
        message.push(HL_NORMAL, " in ");
        if let Some(at) = bkpt.get("at").as_str() {
            message.push(hl, at);
        } else if let Some(func) = bkpt.get("func").as_str() {
            message.push(hl, func);
        } else if jumpable {
            let basename = Path::new(&br.fullname)
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default();
            message.push(hl, format_args!("{basename}:{}", br.lnum));
        } else {
            message.push(hl, bkpt.get("addr").str_or("???"));
        }
    }

    let line = ctx.session.borrow().num_lines_written;
    ctx.show_message(&message);
    if ctx.session.borrow().num_lines_written == line {
        return;
    }
    if !br.enabled {
        ctx.highlight_last_range(0, message.len(), "@markup.strikethrough");
    }
    if jumpable {
        ctx.session
            .borrow_mut()
            .jumps
            .insert(line, &br.fullname, br.lnum);
    }
}

/// Remove the signs of `id` and its locations, optionally forgetting the breakpoint.
async fn clear_breakpoint_sign(ctx: Rc<Context>, id: String, should_delete: bool) -> Result<(), Error> {
    let placed: Vec<(String, String, i64)> = {
        let mut table = ctx.breakpoints.borrow_mut();
        let placed: Vec<_> = table
            .aliases(&id)
            .filter(|(_, br)| !br.fullname.is_empty() && br.is_placed())
            .map(|(alias, br)| (alias.to_string(), br.fullname.clone(), br.extmark))
            .collect();
        // marks are owned by this handler from now on
        for (alias, _, _) in &placed {
            if let Some(br) = table.find_mut(alias) {
                br.extmark = 0;
            }
        }
        if should_delete {
            table.delete(&id);
        }
        placed
    };

    let mut queue = ctx.rpc_queue::<i64>();
    for (_, fullname, _) in &placed {
        queue.push(ctx.promise_buffer_number(fullname));
    }
    for (alias, _, extmark) in placed {
        let Some(awaiter) = queue.next() else {
            break;
        };
        let bufnr = awaiter.await?;
        if bufnr > 0 {
            ctx.delete_breakpoint_mark(bufnr, extmark);
        } else {
            log::debug!(target: "coordinator", "Buffer of breakpoint {alias} is gone");
        }
    }
    Ok(())
}

/// Put a sign on the line of `id` if its source is open in the editor.
async fn place_breakpoint_sign(ctx: Rc<Context>, id: String) -> Result<(), Error> {
    let fullname = {
        let table = ctx.breakpoints.borrow();
        let Some(br) = table.find(&id) else {
            return Ok(());
        };
        if br.fullname.is_empty() || br.is_placed() || !file_readable(&br.fullname) {
            return Ok(());
        }
        br.fullname.clone()
    };

    let bufnr = ctx.promise_buffer_number(&fullname).await?;
    if bufnr < 0 {
        return Ok(());
    }

    let awaiter = {
        let table = ctx.breakpoints.borrow();
        let Some(br) = table.find(&id) else {
            return Ok(());
        };
        ctx.promise_breakpoint_mark(&id, bufnr, br.lnum, br.enabled)
    };
    let extmark = awaiter.await?;

    // deleted meanwhile, or placed by a newer handler
    let stale = match ctx.breakpoints.borrow_mut().find_mut(&id) {
        Some(br) => std::mem::replace(&mut br.extmark, extmark),
        None => extmark,
    };
    if stale > 0 {
        ctx.delete_breakpoint_mark(bufnr, stale);
    }
    Ok(())
}

/// Place missing signs of breakpoints in a freshly opened file.
fn place_file_signs(ctx: &Rc<Context>, fullname: &str) {
    let ids: Vec<String> = ctx
        .breakpoints
        .borrow()
        .iter()
        .filter(|(_, br)| {
            br.kind == BreakpointType::Break && br.fullname == fullname && !br.is_placed()
        })
        .map(|(id, _)| id.to_string())
        .collect();
    for id in ids {
        ctx.spawn("place breakpoint sign", place_breakpoint_sign(ctx.clone(), id));
    }
}
