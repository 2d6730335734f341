//! Minimal RFC 959 control connection

use regex::Regex;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use crate::protocols::types::Transport;

pub const FTP_PORT: u16 = 21;

static PASV_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+)").expect("valid PASV pattern")
});

static TRANSFER_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*(\d+)\s+bytes\s*\)").expect("valid size pattern"));

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("{code} {message}")]
    Reply { code: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FtpError {
    pub fn code(&self) -> Option<u16> {
        match self {
            FtpError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `550`: the file is not there, so the caller may try a listing
    pub fn is_file_unavailable(&self) -> bool {
        self.code() == Some(550)
    }

    /// Worth one more attempt on a fresh connection
    pub fn is_transient(&self) -> bool {
        match self {
            FtpError::Io(_) | FtpError::Protocol(_) => true,
            FtpError::Reply { code, .. } => (400..500).contains(code),
        }
    }
}

pub type FtpResult<T> = Result<T, FtpError>;

/// Representation requested with `TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Ascii,
    Image,
    /// Directory listing, transferred as ASCII
    Directory,
}

impl TransferType {
    /// Parse a `;type=` attribute value
    pub fn from_attr(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "a" => Some(TransferType::Ascii),
            "i" => Some(TransferType::Image),
            "d" => Some(TransferType::Directory),
            _ => None,
        }
    }

    pub fn type_command(&self) -> &'static str {
        match self {
            TransferType::Ascii | TransferType::Directory => "TYPE A",
            TransferType::Image => "TYPE I",
        }
    }
}

/// Control-connection commands the cache relies on
pub trait FtpControl {
    fn login(&mut self, user: &str, password: &str) -> FtpResult<()>;

    fn cwd(&mut self, dir: &str) -> FtpResult<()>;

    /// Send a command and expect a `2xx` completion
    fn voidcmd(&mut self, cmd: &str) -> FtpResult<()>;

    /// Open a data connection for `cmd`; the size comes from a
    /// `150 ... (N bytes)` preliminary reply when the server sends one.
    fn transfer(&mut self, cmd: &str) -> FtpResult<(Box<dyn Transport>, Option<u64>)>;

    /// Read the completion reply of the last transfer
    fn voidresp(&mut self) -> FtpResult<()>;

    fn quit(&mut self) -> FtpResult<()>;
}

/// Opens control connections
pub trait FtpConnector {
    fn connect(&self, host: &str, port: u16) -> FtpResult<Box<dyn FtpControl>>;
}

#[derive(Debug, Clone)]
pub struct TcpFtpConnector {
    timeout: Duration,
}

impl TcpFtpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl FtpConnector for TcpFtpConnector {
    fn connect(&self, host: &str, port: u16) -> FtpResult<Box<dyn FtpControl>> {
        Ok(Box::new(FtpClient::connect(host, port, self.timeout)?))
    }
}

/// Blocking control connection over TCP
#[derive(Debug)]
pub struct FtpClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
}

impl FtpClient {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> FtpResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FtpError::Protocol(format!("{host}: no address")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;

        let mut client = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            peer: addr,
            timeout,
        };
        client.expect_completion()?;
        Ok(client)
    }

    fn getline(&mut self) -> FtpResult<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(FtpError::Protocol("connection closed".to_string()));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!(line = %line, "ftp <");
        Ok(line)
    }

    /// One reply, folding `xyz-` continuation lines.
    fn getresp(&mut self) -> FtpResult<(u16, String)> {
        let first = self.getline()?;
        let code = reply_code(&first)?;
        let mut text = first.clone();

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.getline()?;
                text.push('\n');
                text.push_str(&line);
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }

        let message = text.get(4..).unwrap_or_default().to_string();
        if code >= 400 {
            return Err(FtpError::Reply { code, message });
        }
        Ok((code, message))
    }

    fn sendcmd(&mut self, cmd: &str) -> FtpResult<(u16, String)> {
        trace!(cmd = %redact(cmd), "ftp >");
        self.writer.write_all(cmd.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.getresp()
    }

    fn expect_completion(&mut self) -> FtpResult<()> {
        let (code, message) = self.getresp()?;
        if !(200..300).contains(&code) {
            return Err(FtpError::Reply { code, message });
        }
        Ok(())
    }

    fn passive(&mut self) -> FtpResult<SocketAddr> {
        let (code, message) = self.sendcmd("PASV")?;
        if code != 227 {
            return Err(FtpError::Reply { code, message });
        }
        let port = pasv_port(&message)?;

        // The advertised address is ignored; data comes from the control peer.
        Ok(SocketAddr::new(self.peer.ip(), port))
    }
}

impl FtpControl for FtpClient {
    fn login(&mut self, user: &str, password: &str) -> FtpResult<()> {
        let user = if user.is_empty() { "anonymous" } else { user };
        let password = if password.is_empty() && user == "anonymous" {
            "anonymous@"
        } else {
            password
        };

        let (mut code, _) = self.sendcmd(&format!("USER {user}"))?;
        if (300..400).contains(&code) {
            code = self.sendcmd(&format!("PASS {password}"))?.0;
        }
        if (300..400).contains(&code) {
            code = self.sendcmd("ACCT ")?.0;
        }
        if !(200..300).contains(&code) {
            return Err(FtpError::Protocol(format!("login ended with {code}")));
        }
        Ok(())
    }

    fn cwd(&mut self, dir: &str) -> FtpResult<()> {
        match dir {
            ".." => self.voidcmd("CDUP"),
            "" => self.voidcmd("CWD ."),
            dir => self.voidcmd(&format!("CWD {dir}")),
        }
    }

    fn voidcmd(&mut self, cmd: &str) -> FtpResult<()> {
        let (code, message) = self.sendcmd(cmd)?;
        if !(200..300).contains(&code) {
            return Err(FtpError::Reply { code, message });
        }
        Ok(())
    }

    fn transfer(&mut self, cmd: &str) -> FtpResult<(Box<dyn Transport>, Option<u64>)> {
        let addr = self.passive()?;
        let data = TcpStream::connect_timeout(&addr, self.timeout)?;
        data.set_read_timeout(Some(self.timeout))?;

        let (mut code, mut message) = self.sendcmd(cmd)?;
        if (200..300).contains(&code) {
            (code, message) = self.getresp()?;
        }
        if !(100..200).contains(&code) {
            return Err(FtpError::Reply { code, message });
        }

        let size = (code == 150).then(|| transfer_size(&message)).flatten();
        Ok((Box::new(data), size))
    }

    fn voidresp(&mut self) -> FtpResult<()> {
        self.expect_completion()
    }

    fn quit(&mut self) -> FtpResult<()> {
        self.sendcmd("QUIT")?;
        Ok(())
    }
}

fn reply_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| FtpError::Protocol(format!("bad reply line: {line:?}")))
}

/// Data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
fn pasv_port(message: &str) -> FtpResult<u16> {
    let caps = PASV_REPLY
        .captures(message)
        .ok_or_else(|| FtpError::Protocol(format!("bad PASV reply: {message}")))?;
    let octet = |i: usize| {
        caps[i]
            .parse::<u8>()
            .map(u16::from)
            .map_err(|_| FtpError::Protocol(format!("bad PASV port: {message}")))
    };
    Ok((octet(5)? << 8) | octet(6)?)
}

/// Byte count from a `150 Opening ... (1234 bytes)` reply
pub fn transfer_size(message: &str) -> Option<u64> {
    TRANSFER_SIZE.captures(message)?[1].parse().ok()
}

fn redact(cmd: &str) -> &str {
    if cmd.starts_with("PASS ") { "PASS ****" } else { cmd }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_error_classification() {
        let missing = FtpError::Reply { code: 550, message: "No such file".into() };
        assert!(missing.is_file_unavailable());
        assert!(!missing.is_transient());

        let busy = FtpError::Reply { code: 421, message: "Too many users".into() };
        assert!(busy.is_transient());
        assert_eq!(busy.code(), Some(421));

        let io = FtpError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_transient());
        assert_eq!(io.code(), None);
    }

    #[test]
    fn test_transfer_size() {
        assert_eq!(
            transfer_size("Opening BINARY mode data connection for a.tar (1048576 bytes)."),
            Some(1048576)
        );
        assert_eq!(transfer_size("Opening ASCII mode data connection"), None);
    }

    #[test]
    fn test_pasv_port() {
        let port = pasv_port("Entering Passive Mode (127,0,0,1,195,80).").unwrap();
        assert_eq!(port, 195 * 256 + 80);
        assert!(matches!(
            pasv_port("Entering Passive Mode (127,0,0,1,300,80)."),
            Err(FtpError::Protocol(_))
        ));
        assert!(matches!(pasv_port("Entering Passive Mode"), Err(FtpError::Protocol(_))));
    }

    #[test]
    fn test_transfer_type_attr() {
        assert_eq!(TransferType::from_attr("A"), Some(TransferType::Ascii));
        assert_eq!(TransferType::from_attr("d"), Some(TransferType::Directory));
        assert_eq!(TransferType::from_attr("x"), None);
        assert_eq!(TransferType::Directory.type_command(), "TYPE A");
        assert_eq!(TransferType::Image.type_command(), "TYPE I");
    }

    /// Scripted server: greets, logs in, serves one RETR in passive mode.
    #[test]
    fn test_client_session_against_scripted_server() {
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let data = TcpListener::bind("127.0.0.1:0").unwrap();
        let control_port = control.local_addr().unwrap().port();
        let data_port = data.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (stream, _) = control.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut out = stream;
            let mut seen = Vec::new();
            let read_cmd = |reader: &mut BufReader<TcpStream>| {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                line.trim_end().to_string()
            };

            out.write_all(b"220-Welcome\r\n220 ready\r\n").unwrap();
            for reply in ["331 password please", "230 logged in", "250 ok", "200 type set"] {
                seen.push(read_cmd(&mut reader));
                out.write_all(format!("{reply}\r\n").as_bytes()).unwrap();
            }

            seen.push(read_cmd(&mut reader));
            let pasv = format!(
                "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                data_port >> 8,
                data_port & 0xff
            );
            out.write_all(pasv.as_bytes()).unwrap();
            let (mut data_stream, _) = data.accept().unwrap();

            seen.push(read_cmd(&mut reader));
            out.write_all(b"150 Opening BINARY mode data connection (5 bytes)\r\n").unwrap();
            data_stream.write_all(b"hello").unwrap();
            drop(data_stream);
            out.write_all(b"226 done\r\n").unwrap();

            seen.push(read_cmd(&mut reader));
            out.write_all(b"221 bye\r\n").unwrap();
            tx.send(seen).unwrap();
        });

        let mut client =
            FtpClient::connect("127.0.0.1", control_port, Duration::from_secs(5)).unwrap();
        client.login("", "").unwrap();
        client.cwd("pub").unwrap();
        client.voidcmd("TYPE I").unwrap();

        let (mut stream, size) = client.transfer("RETR hello.txt").unwrap();
        assert_eq!(size, Some(5));
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello");
        drop(stream);

        client.voidresp().unwrap();
        client.quit().unwrap();

        let seen = rx.recv().unwrap();
        assert_eq!(
            seen,
            vec![
                "USER anonymous",
                "PASS anonymous@",
                "CWD pub",
                "TYPE I",
                "PASV",
                "RETR hello.txt",
                "QUIT",
            ]
        );
    }
}
