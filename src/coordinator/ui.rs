//! Editor side effects: prompt buffer messages, highlights and breakpoint marks.

use crate::coordinator::awaiter::{IntegerArrayAwaiter, IntegerAwaiter, StringAwaiter};
use crate::coordinator::session::{BufferSlot, Namespace};
use crate::coordinator::Context;
use crate::parser::rpc_builder::RpcArg;
use smallvec::SmallVec;
use std::fmt::{self, Write};

/// Most lines a single `nvim_buf_set_lines` call carries.
const LINES_PER_REQUEST: usize = 15;
const MAX_PARTS: usize = 16;

pub const HL_NORMAL: &str = "Normal";
pub const HL_WARNING: &str = "WarningMsg";
pub const HL_ERROR: &str = "ErrorMsg";
pub const HL_BREAKPOINT: &str = "debugBreakpoint";
pub const HL_BREAKPOINT_DISABLED: &str = "debugBreakpointDisabled";

/// One prompt line assembled from highlighted segments.
#[derive(Debug, Default)]
pub struct Message {
    text: String,
    parts: SmallVec<[(usize, &'static str); MAX_PARTS]>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hl: &'static str, segment: impl fmt::Display) -> &mut Self {
        if self.parts.len() >= MAX_PARTS {
            crate::fatal!("Message: more than {MAX_PARTS} segments");
        }
        let start = self.text.len();
        _ = write!(self.text, "{segment}");
        self.parts.push((self.text.len() - start, hl));
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Byte ranges of highlighted segments, plain ones are left out.
    pub fn highlights(&self) -> impl Iterator<Item = (usize, usize, &'static str)> + '_ {
        let mut start = 0;
        self.parts.iter().filter_map(move |&(len, hl)| {
            let range = (start, start + len, hl);
            start += len;
            (hl != HL_NORMAL).then_some(range)
        })
    }
}

/// Sign text of a breakpoint: at most two trailing characters of its main number.
pub fn sign_text(id: &str) -> &str {
    let main = id.split('.').next().unwrap_or(id);
    let skip = main.chars().count().saturating_sub(2);
    match main.char_indices().nth(skip) {
        Some((pos, _)) => &main[pos..],
        None => main,
    }
}

impl Context {
    fn prompt_buffer(&self) -> Option<i64> {
        let bufnr = self.session.borrow().buffer(BufferSlot::Prompt);
        (bufnr >= 0).then_some(bufnr)
    }

    pub fn show_normal(&self, msg: &str) {
        self.show_lines(msg.lines());
    }

    pub fn show_warning(&self, msg: &str) {
        self.show_normal(msg);
        self.highlight_last_line(HL_WARNING);
    }

    pub fn show_error(&self, msg: &str) {
        self.show_normal(msg);
        self.highlight_last_line(HL_ERROR);
    }

    /// Append lines to the prompt buffer.
    pub fn show_lines<'l>(&self, lines: impl Iterator<Item = &'l str>) {
        let lines: Vec<&str> = lines.collect();
        if lines.is_empty() {
            return;
        }
        let Some(bufnr) = self.prompt_buffer() else {
            for line in lines {
                log::info!(target: "coordinator", "{line}");
            }
            return;
        };

        for chunk in lines.chunks(LINES_PER_REQUEST) {
            let start = self.session.borrow().num_lines_written;
            let mut editor = self.editor.borrow_mut();
            let (_, builder) = editor.begin_rpc_request(
                "nvim_buf_set_lines",
                &[
                    RpcArg::Int(bufnr),
                    RpcArg::Int(start),
                    RpcArg::Int(start),
                    RpcArg::Bool(true),
                ],
            );
            builder.open_array();
            for line in chunk {
                builder
                    .add_uninitialized_string(line.len())
                    .copy_from_slice(line.as_bytes());
            }
            builder.close_array();
            editor.end_rpc_request();
            self.session.borrow_mut().num_lines_written += chunk.len() as i64;
        }
    }

    /// Write one highlighted line into the prompt buffer.
    pub fn show_message(&self, message: &Message) {
        let Some(bufnr) = self.prompt_buffer() else {
            log::info!(target: "coordinator", "{}", message.text());
            return;
        };
        let (line, ns) = {
            let session = self.session.borrow();
            (session.num_lines_written, session.namespace(Namespace::PromptBuffer))
        };
        self.request(
            "nvim_buf_set_lines",
            &[
                RpcArg::Int(bufnr),
                RpcArg::Int(line),
                RpcArg::Int(line),
                RpcArg::Bool(true),
                RpcArg::Array(vec![RpcArg::Str(message.text())]),
            ],
        );
        for (start, end, hl) in message.highlights() {
            self.request(
                "nvim_buf_set_extmark",
                &[
                    RpcArg::Int(bufnr),
                    RpcArg::Int(ns),
                    RpcArg::Int(line),
                    RpcArg::Int(start as i64),
                    RpcArg::Map(vec![
                        (RpcArg::Str("end_col"), RpcArg::Int(end as i64)),
                        (RpcArg::Str("hl_group"), RpcArg::Str(hl)),
                    ]),
                ],
            );
        }
        self.mark_unmodified(bufnr);
        self.session.borrow_mut().num_lines_written += 1;
    }

    pub fn highlight_last_line(&self, hl: &str) {
        self.highlight_last(None, hl);
    }

    pub fn highlight_last_range(&self, start_col: usize, end_col: usize, hl: &str) {
        self.highlight_last(Some((start_col, end_col)), hl);
    }

    fn highlight_last(&self, range: Option<(usize, usize)>, hl: &str) {
        let Some(bufnr) = self.prompt_buffer() else {
            return;
        };
        let (line, ns) = {
            let session = self.session.borrow();
            (session.num_lines_written - 1, session.namespace(Namespace::PromptBuffer))
        };
        if line < 0 {
            return;
        }
        let (start, opts) = match range {
            Some((start, end)) => (
                start,
                vec![
                    (RpcArg::Str("end_col"), RpcArg::Int(end as i64)),
                    (RpcArg::Str("hl_group"), RpcArg::Str(hl)),
                ],
            ),
            None => (0, vec![(RpcArg::Str("line_hl_group"), RpcArg::Str(hl))]),
        };
        self.request(
            "nvim_buf_set_extmark",
            &[
                RpcArg::Int(bufnr),
                RpcArg::Int(ns),
                RpcArg::Int(line),
                RpcArg::Int(start as i64),
                RpcArg::Map(opts),
            ],
        );
    }

    pub fn mark_unmodified(&self, bufnr: i64) {
        self.request(
            "nvim_set_option_value",
            &[
                RpcArg::Str("modified"),
                RpcArg::Bool(false),
                RpcArg::Map(vec![(RpcArg::Str("buf"), RpcArg::Int(bufnr))]),
            ],
        );
    }

    /// Drop every line of the prompt buffer.
    pub fn reset_prompt_buffer(&self) {
        let Some(bufnr) = self.prompt_buffer() else {
            return;
        };
        self.request(
            "nvim_buf_set_lines",
            &[
                RpcArg::Int(bufnr),
                RpcArg::Int(0),
                RpcArg::Int(-1),
                RpcArg::Bool(false),
                RpcArg::Array(vec![]),
            ],
        );
        self.mark_unmodified(bufnr);
        let mut session = self.session.borrow_mut();
        session.num_lines_written = 0;
        session.jumps.clear();
    }

    pub fn clear_namespace(&self, bufnr: i64, ns: Namespace) {
        let ns = self.session.borrow().namespace(ns);
        self.request(
            "nvim_buf_clear_namespace",
            &[RpcArg::Int(bufnr), RpcArg::Int(ns), RpcArg::Int(0), RpcArg::Int(-1)],
        );
    }

    pub fn set_buffer_name(&self, bufnr: i64, name: &str) {
        self.request("nvim_buf_set_name", &[RpcArg::Int(bufnr), RpcArg::Str(name)]);
    }

    pub fn promise_namespace(&self, name: &str) -> IntegerAwaiter<'_> {
        self.promise("nvim_create_namespace", &[RpcArg::Str(name)])
    }

    pub fn promise_create_buffer(&self) -> IntegerAwaiter<'_> {
        self.promise("nvim_create_buf", &[RpcArg::Bool(true), RpcArg::Bool(false)])
    }

    pub fn promise_buffer_name(&self, bufnr: i64) -> StringAwaiter<'_> {
        self.promise("nvim_buf_get_name", &[RpcArg::Int(bufnr)])
    }

    pub fn promise_buffer_list(&self) -> IntegerArrayAwaiter<'_> {
        self.promise("nvim_list_bufs", &[])
    }

    /// Number of the buffer showing `fullname`, -1 if none.
    pub fn promise_buffer_number(&self, fullname: &str) -> IntegerAwaiter<'_> {
        self.promise(
            "nvim_call_function",
            &[
                RpcArg::Str("bufnr"),
                RpcArg::Array(vec![RpcArg::Str(fullname)]),
            ],
        )
    }

    /// Place a breakpoint sign, resolves to the mark id.
    pub fn promise_breakpoint_mark(
        &self,
        id: &str,
        bufnr: i64,
        lnum: i64,
        enabled: bool,
    ) -> IntegerAwaiter<'_> {
        let ns = self.session.borrow().namespace(Namespace::Breakpoint);
        let hl = if enabled {
            HL_BREAKPOINT
        } else {
            HL_BREAKPOINT_DISABLED
        };
        self.promise(
            "nvim_buf_set_extmark",
            &[
                RpcArg::Int(bufnr),
                RpcArg::Int(ns),
                RpcArg::Int(lnum - 1),
                RpcArg::Int(0),
                RpcArg::Map(vec![
                    (RpcArg::Str("sign_text"), RpcArg::Str(sign_text(id))),
                    (RpcArg::Str("sign_hl_group"), RpcArg::Str(hl)),
                ]),
            ],
        )
    }

    pub fn delete_breakpoint_mark(&self, bufnr: i64, extmark: i64) {
        let ns = self.session.borrow().namespace(Namespace::Breakpoint);
        self.request(
            "nvim_buf_del_extmark",
            &[RpcArg::Int(bufnr), RpcArg::Int(ns), RpcArg::Int(extmark)],
        );
    }
}
