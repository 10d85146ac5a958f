//! File and socket handle cells
//!
//! Handles own an OS resource behind a mutex. Closing releases the resource
//! early; dropping the last reference closes it implicitly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use parking_lot::Mutex;

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::memory::{self, HeapCell, RcHeader};
use crate::value::Value;

// =============================================================================
// Files
// =============================================================================

pub struct FileCell {
    pub(crate) header: RcHeader,
    file: Mutex<Option<File>>,
    path: String,
    mode: String,
}

impl HeapCell for FileCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }
}

fn open_options(mode: &str) -> RtResult<OpenOptions> {
    let mut opts = OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => opts.read(true),
        "r+" => opts.read(true).write(true),
        "w" => opts.write(true).create(true).truncate(true),
        "w+" => opts.read(true).write(true).create(true).truncate(true),
        "a" => opts.append(true).create(true),
        "a+" => opts.read(true).append(true).create(true),
        other => {
            return Err(RtError::runtime(format!("Invalid file mode '{other}'")));
        }
    };
    Ok(opts)
}

/// Open `path` with a C-style mode string (`r`, `w`, `a`, with optional `+`).
pub fn open(path: &str, mode: &str) -> RtResult<Value> {
    let file = open_options(mode)?
        .open(path)
        .map_err(|e| RtError::runtime(format!("Failed to open '{path}': {e}")))?;
    tracing::debug!(path, mode, "opened file");
    let cell = FileCell {
        header: RcHeader::new(),
        file: Mutex::new(Some(file)),
        path: path.to_string(),
        mode: mode.to_string(),
    };
    Ok(Value::File(memory::alloc_cell(cell)))
}

fn file_cell<'a>(file: &'a Value, op: &str) -> RtResult<&'a FileCell> {
    match *file {
        Value::File(p) => Ok(unsafe { p.as_ref() }),
        _ => Err(RtError::type_mismatch(format!("{op}() expects file object"))),
    }
}

fn with_open_file<R>(
    file: Value,
    op: &str,
    f: impl FnOnce(&mut File) -> std::io::Result<R>,
) -> RtResult<R> {
    let cell = file_cell(&file, op)?;
    let mut guard = cell.file.lock();
    let handle = guard.as_mut().ok_or_else(|| {
        RtError::runtime(format!("Cannot {op} closed file '{}'", cell.path))
    })?;
    f(handle).map_err(|e| RtError::runtime(format!("{op}() failed on '{}': {e}", cell.path)))
}

/// Read the rest of the file as a string.
pub fn read_all(file: Value) -> RtResult<Value> {
    let text = with_open_file(file, "read", |f| {
        let mut text = String::new();
        f.read_to_string(&mut text)?;
        Ok(text)
    })?;
    Ok(Value::string(text))
}

/// Write the string form of `data`. Returns the number of bytes written.
pub fn write(file: Value, data: Value) -> RtResult<usize> {
    let text = crate::format::to_string(data);
    with_open_file(file, "write", |f| {
        f.write_all(text.as_bytes())?;
        Ok(text.len())
    })
}

/// Close the file. Closing twice is a no-op.
pub fn close(file: Value) -> RtResult<()> {
    let cell = file_cell(&file, "close")?;
    if let Some(mut f) = cell.file.lock().take() {
        f.flush()
            .map_err(|e| RtError::runtime(format!("close() failed on '{}': {e}", cell.path)))?;
    }
    Ok(())
}

pub fn path(file: Value) -> RtResult<String> {
    Ok(file_cell(&file, "path")?.path.clone())
}

pub fn mode(file: Value) -> RtResult<String> {
    Ok(file_cell(&file, "mode")?.mode.clone())
}

// =============================================================================
// Sockets
// =============================================================================

pub struct SocketCell {
    pub(crate) header: RcHeader,
    stream: Mutex<Option<TcpStream>>,
    peer: String,
}

impl HeapCell for SocketCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }
}

/// Wrap a connected stream in a socket value.
pub fn socket_from_stream(stream: TcpStream) -> Value {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let cell = SocketCell {
        header: RcHeader::new(),
        stream: Mutex::new(Some(stream)),
        peer,
    };
    Value::Socket(memory::alloc_cell(cell))
}

/// Connect a TCP socket to `host:port`.
pub fn connect(host: &str, port: u16) -> RtResult<Value> {
    let stream = TcpStream::connect((host, port))
        .map_err(|e| RtError::runtime(format!("connect() to {host}:{port} failed: {e}")))?;
    Ok(socket_from_stream(stream))
}

fn with_open_socket<R>(
    sock: Value,
    op: &str,
    f: impl FnOnce(&mut TcpStream) -> std::io::Result<R>,
) -> RtResult<R> {
    let Value::Socket(p) = sock else {
        return Err(RtError::type_mismatch(format!("{op}() expects socket")));
    };
    let cell = unsafe { p.as_ref() };
    let mut guard = cell.stream.lock();
    let stream = guard
        .as_mut()
        .ok_or_else(|| RtError::runtime(format!("Cannot {op} on closed socket")))?;
    f(stream).map_err(|e| RtError::runtime(format!("{op}() failed on {}: {e}", cell.peer)))
}

/// Send the bytes of a string or buffer. Returns the byte count.
pub fn send(sock: Value, data: Value) -> RtResult<usize> {
    let bytes = match data {
        Value::Buffer(_) => {
            let n = crate::buffer::len(data)?;
            (0..n as i64)
                .map(|i| match crate::buffer::get(data, i) {
                    Ok(Value::U8(b)) => Ok(b),
                    Ok(_) => Ok(0),
                    Err(e) => Err(e),
                })
                .collect::<RtResult<Vec<u8>>>()?
        }
        other => crate::format::to_string(other).into_bytes(),
    };
    with_open_socket(sock, "send", |s| {
        s.write_all(&bytes)?;
        Ok(bytes.len())
    })
}

/// Receive up to `max` bytes into a fresh buffer. An empty buffer means the
/// peer closed the connection.
pub fn recv(sock: Value, max: usize) -> RtResult<Value> {
    let bytes = with_open_socket(sock, "recv", |s| {
        let mut buf = vec![0u8; max];
        let n = s.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    })?;
    Ok(Value::buffer_from(bytes))
}

/// Close the socket. Closing twice is a no-op.
pub fn close_socket(sock: Value) -> RtResult<()> {
    let Value::Socket(p) = sock else {
        return Err(RtError::type_mismatch("close() expects socket"));
    };
    if let Some(stream) = unsafe { p.as_ref() }.stream.lock().take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
    Ok(())
}

// =============================================================================
// C ABI
// =============================================================================

fn str_arg(value: Value, op: &str) -> RtResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RtError::type_mismatch(format!("{op}() expects string")))
}

/// A null mode opens for reading.
///
/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_open(path: Value, mode: Value) -> Value {
    abi_value((|| {
        let path = str_arg(path, "open")?;
        let mode = if mode.is_null() {
            "r".to_string()
        } else {
            str_arg(mode, "open")?
        };
        open(&path, &mode)
    })())
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_file_read_all(file: Value) -> Value {
    abi_value(read_all(file))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_file_write(file: Value, data: Value) -> Value {
    abi_value(write(file, data).map(|n| Value::I32(n as i32)))
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_file_close(file: Value) {
    abi_unit(close(file));
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_socket_connect(host: Value, port: Value) -> Value {
    abi_value((|| {
        let host = str_arg(host, "connect")?;
        let port = expect_int(port, "connect")?;
        let port = u16::try_from(port)
            .map_err(|_| RtError::range(format!("Port {port} out of range [0, 65535]")))?;
        connect(&host, port)
    })())
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_socket_send(sock: Value, data: Value) -> Value {
    abi_value(send(sock, data).map(|n| Value::I32(n as i32)))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_socket_recv(sock: Value, max: Value) -> Value {
    abi_value(expect_int(max, "recv").and_then(|n| recv(sock, n.max(0) as usize)))
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_socket_close(sock: Value) {
    abi_unit(close_socket(sock));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_file_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path = path.to_str().unwrap();

        let f = open(path, "w").unwrap();
        assert_eq!(f.type_name(), "file");
        let text = Value::string_from("hello ");
        assert_eq!(write(f, text).unwrap(), 6);
        write(f, Value::I32(42)).unwrap();
        close(f).unwrap();
        close(f).unwrap();
        assert!(write(f, text).is_err());
        f.release();
        text.release();

        let f = open(path, "r").unwrap();
        assert_eq!(mode(f).unwrap(), "r");
        let content = read_all(f).unwrap();
        assert_eq!(content.as_str(), Some("hello 42"));
        content.release();
        f.release();
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert!(open(path.to_str().unwrap(), "r").is_err());
        assert!(open(path.to_str().unwrap(), "q").is_err());
    }

    #[test]
    fn test_socket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let sock = connect("127.0.0.1", port).unwrap();
        let msg = Value::string_from("ping");
        assert_eq!(send(sock, msg).unwrap(), 4);
        let reply = recv(sock, 4).unwrap();
        assert_eq!(crate::buffer::len(reply).unwrap(), 4);
        server.join().unwrap();
        close_socket(sock).unwrap();
        assert!(send(sock, msg).is_err());
        for v in [sock, msg, reply] {
            v.release();
        }
    }
}
