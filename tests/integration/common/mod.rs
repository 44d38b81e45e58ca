use pdp::config::Config;
use pdp::coordinator::session::Namespace;
use pdp::coordinator::{Context, Coordinator};
use pdp::driver::gdb::GdbDriver;
use pdp::expr::view::RpcExprView;
use pdp::expr::ExprTree;
use pdp::io::byte_stream::ByteStream;
use pdp::io::descriptor::{pipe, InputDescriptor};
use pdp::parser::rpc_parser::RpcParser;
use pdp::system::child_reaper::ChildReaper;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;
use strum::IntoEnumIterator;
use timeout_readwrite::TimeoutReader;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Buffer the editor already shows as the prompt.
pub const PROMPT_BUF: i64 = 1;
/// Namespace ids handed out during initialization, in `Namespace` order starting at 10.
pub const PROMPT_NS: i64 = 13;
pub const BREAKPOINT_NS: i64 = 16;

pub fn mp_int(v: i64) -> Vec<u8> {
    match v {
        0..=0x7f => vec![v as u8],
        -32..=-1 => vec![v as i8 as u8],
        0x80..=0xffff => {
            let mut bytes = vec![0xcd];
            bytes.extend_from_slice(&(v as u16).to_be_bytes());
            bytes
        }
        _ => {
            let mut bytes = vec![0xd3];
            bytes.extend_from_slice(&v.to_be_bytes());
            bytes
        }
    }
}

pub fn mp_str(s: &str) -> Vec<u8> {
    let mut bytes = if s.len() < 32 {
        vec![0xa0 | s.len() as u8]
    } else {
        vec![0xd9, s.len() as u8]
    };
    bytes.extend_from_slice(s.as_bytes());
    bytes
}

pub fn mp_array(items: &[Vec<u8>]) -> Vec<u8> {
    assert!(items.len() < 16);
    let mut bytes = vec![0x90 | items.len() as u8];
    for item in items {
        bytes.extend_from_slice(item);
    }
    bytes
}

pub const MP_NIL: u8 = 0xc0;

/// Request sent by the coordinator to the editor.
pub struct Request {
    tree: ExprTree,
}

impl Request {
    pub fn token(&self) -> u32 {
        self.tree.rpc_view().at(1).require_int() as u32
    }

    pub fn method(&self) -> &str {
        self.tree.rpc_view().at(2).require_str()
    }

    pub fn args(&self) -> RpcExprView<'_> {
        self.tree.rpc_view().at(3)
    }

    pub fn arg(&self, index: usize) -> RpcExprView<'_> {
        self.args().at(index)
    }

    pub fn int_arg(&self, index: usize) -> i64 {
        self.arg(index).require_int()
    }
}

/// Coordinator wired to a fake GDB and a fake editor through pipes.
pub struct Harness {
    pub coordinator: Coordinator,
    editor_rx: ByteStream,
    editor_tx: Option<File>,
    gdb_stdin: BufReader<TimeoutReader<File>>,
    gdb_stdout: Option<File>,
    _gdb_stderr: OwnedFd,
}

impl Harness {
    pub fn new() -> Self {
        let (gdb_in_read, gdb_in_write) = pipe().unwrap();
        let (gdb_out_read, gdb_out_write) = pipe().unwrap();
        let (gdb_err_read, gdb_err_write) = pipe().unwrap();
        let gdb = GdbDriver::start_with(gdb_in_write, gdb_out_read, gdb_err_read, TIMEOUT).unwrap();

        let (editor_in_read, editor_in_write) = pipe().unwrap();
        let (editor_out_read, editor_out_write) = pipe().unwrap();
        let config = Config {
            read_timeout: TIMEOUT,
            write_timeout: TIMEOUT,
            ..Config::default()
        };
        let coordinator = Coordinator::with_gdb(
            &config,
            gdb,
            ChildReaper::new().unwrap(),
            None,
            editor_in_read,
            editor_out_write,
        )
        .unwrap();

        Self {
            coordinator,
            editor_rx: ByteStream::new(InputDescriptor::new(editor_out_read).unwrap(), TIMEOUT),
            editor_tx: Some(File::from(editor_in_write)),
            gdb_stdin: BufReader::new(TimeoutReader::new(File::from(gdb_in_read), TIMEOUT)),
            gdb_stdout: Some(File::from(gdb_out_write)),
            _gdb_stderr: gdb_err_write,
        }
    }

    pub fn ctx(&self) -> &Rc<Context> {
        self.coordinator.context()
    }

    /// Let the coordinator handle everything written so far.
    pub fn pump(&mut self) {
        self.coordinator.poll(Duration::from_millis(500)).unwrap();
    }

    pub fn request(&mut self) -> Request {
        let tree = RpcParser::new(&mut self.editor_rx).try_parse().unwrap();
        assert_eq!(tree.rpc_view().at(0).as_int(), Some(0), "not a request");
        Request { tree }
    }

    pub fn expect(&mut self, method: &str) -> Request {
        let request = self.request();
        assert_eq!(request.method(), method);
        request
    }

    pub fn assert_no_request(&mut self) {
        assert_eq!(self.editor_rx.buffered(), 0);
        let ready = self
            .editor_rx
            .input()
            .wait_for_input(Duration::from_millis(50))
            .unwrap();
        assert!(!ready, "unexpected request from the coordinator");
    }

    fn send_editor(&mut self, frame: &[u8]) {
        self.editor_tx.as_mut().unwrap().write_all(frame).unwrap();
    }

    pub fn respond(&mut self, token: u32, result: &[u8]) {
        let mut frame = vec![0x94, 0x01];
        frame.extend_from_slice(&mp_int(token as i64));
        frame.push(MP_NIL);
        frame.extend_from_slice(result);
        self.send_editor(&frame);
    }

    pub fn notify(&mut self, method: &str, params: &[Vec<u8>]) {
        let mut frame = vec![0x93, 0x02];
        frame.extend_from_slice(&mp_str(method));
        frame.extend_from_slice(&mp_array(params));
        self.send_editor(&frame);
    }

    pub fn close_editor(&mut self) {
        self.editor_tx.take();
    }

    /// Write MI records as GDB would print them.
    pub fn gdb_records(&mut self, records: &[&str]) {
        let stdout = self.gdb_stdout.as_mut().unwrap();
        for record in records {
            writeln!(stdout, "{record}").unwrap();
        }
    }

    /// Next line the coordinator wrote to GDB stdin.
    pub fn gdb_command(&mut self) -> String {
        let mut line = String::new();
        self.gdb_stdin.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    pub fn close_gdb(&mut self) {
        self.gdb_stdout.take();
    }

    /// Answer the namespace and buffer discovery requests sent on startup.
    ///
    /// The editor reports buffer 1 as the prompt and buffer 2 as unnamed, so the
    /// capture, disassembly and i/o buffers get created as 20, 21 and 22.
    pub fn initialize(&mut self) {
        let mut namespaces = vec![];
        for ns in Namespace::iter() {
            let request = self.expect("nvim_create_namespace");
            assert_eq!(request.arg(0), ns.name());
            namespaces.push(request.token());
        }
        let list = self.expect("nvim_list_bufs");

        for (i, token) in namespaces.into_iter().enumerate() {
            self.respond(token, &mp_int(10 + i as i64));
        }
        self.respond(list.token(), &mp_array(&[mp_int(PROMPT_BUF), mp_int(2)]));
        self.pump();

        let first = self.expect("nvim_buf_get_name");
        assert_eq!(first.int_arg(0), PROMPT_BUF);
        let second = self.expect("nvim_buf_get_name");
        assert_eq!(second.int_arg(0), 2);
        self.respond(first.token(), &mp_str("/tmp/x/Gdb prompt"));
        self.respond(second.token(), &mp_str(""));
        self.pump();

        for bufnr in [20, 21, 22] {
            let create = self.expect("nvim_create_buf");
            self.respond(create.token(), &mp_int(bufnr));
            self.pump();
            let name = self.expect("nvim_buf_set_name");
            assert_eq!(name.int_arg(0), bufnr);
        }

        let reset = self.expect("nvim_buf_set_lines");
        assert_eq!(reset.int_arg(0), PROMPT_BUF);
        assert_eq!(reset.int_arg(2), -1);
        self.expect("nvim_set_option_value");
        self.assert_no_request();
    }
}

/// Readable source file that lives as long as the value.
pub struct SourceFile {
    pub path: String,
}

impl SourceFile {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("pdp-{}-{name}", std::process::id()));
        std::fs::write(&path, "int main() {\n  int a = 1;\n  int b = 2;\n  return a + b;\n}\n")
            .unwrap();
        let path = std::fs::canonicalize(path).unwrap();
        Self {
            path: path.to_string_lossy().into_owned(),
        }
    }
}

impl Drop for SourceFile {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}
