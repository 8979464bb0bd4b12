//! The FTP control channel and data-connection plumbing.
//!
//! One [`FtpSession`] owns the control connection for its whole life. Data
//! connections are opened per transfer, passive (`PASV`) or active (`PORT`)
//! per configuration, and inherit the control channel's TLS layer when the
//! session was established with `AUTH TLS`.

use crate::parser::{parse_features, parse_list_line, parse_mlsx_line, parse_pasv, Features};
use chrono::Utc;
use libremfs::config::{ConnectionConfig, FtpConfig};
use libremfs::path;
use libremfs::storage::{Error, ErrorKind, FileStats, Result};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub(crate) trait Conn: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Conn for T {}

type ControlStream = BufStream<Box<dyn Conn>>;

/// A reply from the server: three-digit code plus its (possibly multi-line)
/// text.
#[derive(Debug)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    /// 1xx: the transfer is starting.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx: the command completed.
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: the command needs a follow-up (`USER`/`PASS`, `RNFR`/`RNTO`).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Maps a failure reply onto the error taxonomy. Temporary 4xx codes become
/// transient kinds the retry loop may re-attempt; permanent 5xx codes are
/// classified by code and, for 550, by the reply text the way servers
/// actually phrase it.
pub(crate) fn translate_reply(reply: Reply) -> Error {
    let text = reply.text.to_lowercase();
    let kind = match reply.code {
        400..=499 => ErrorKind::Unavailable,
        530 | 532 => ErrorKind::AuthFailed,
        550 => {
            if text.contains("not found") || text.contains("no such") || text.contains("doesn't exist")
            {
                ErrorKind::NotFound
            } else if text.contains("permission") || text.contains("denied") {
                ErrorKind::AccessDenied
            } else if text.contains("not empty") {
                ErrorKind::NotEmpty
            } else {
                ErrorKind::NotFound
            }
        }
        553 => ErrorKind::AccessDenied,
        _ => ErrorKind::Fatal,
    };
    Error::new(kind, format!("{} {}", reply.code, reply.text))
}

fn unavailable<E: Into<Box<dyn std::error::Error + Send + Sync>>>(err: E) -> Error {
    Error::new(ErrorKind::Unavailable, err)
}

/// Builds the TLS connector used for `AUTH TLS` and `PROT P` data channels,
/// trusting the platform certificate store.
fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // Unparseable platform certificates are skipped, not fatal.
        let _ = roots.add(cert);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn write_command(stream: &mut ControlStream, command: &str) -> Result<()> {
    let logged = command.split_once(' ').map_or(command, |(verb, _)| {
        if verb == "PASS" { "PASS ***" } else { command }
    });
    debug!(command = logged, "-->");
    stream
        .write_all(format!("{}\r\n", command).as_bytes())
        .await
        .map_err(unavailable)?;
    stream.flush().await.map_err(unavailable)?;
    Ok(())
}

async fn read_reply(stream: &mut ControlStream, limit: Duration) -> Result<Reply> {
    let first = read_control_line(stream, limit).await?;
    if first.len() < 3 {
        return Err(Error::new(ErrorKind::Fatal, format!("malformed reply: {first}")));
    }
    let code: u16 = first[..3]
        .parse()
        .map_err(|_| Error::new(ErrorKind::Fatal, format!("malformed reply: {first}")))?;
    let mut text = first[3..].trim_start_matches([' ', '-']).to_string();
    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{} ", &first[..3]);
        loop {
            let line = read_control_line(stream, limit).await?;
            let done = line.starts_with(&terminator);
            let body = if done { &line[4..] } else { line.as_str() };
            text.push('\n');
            text.push_str(body.trim_end());
            if done {
                break;
            }
        }
    }
    debug!(code, "<--");
    Ok(Reply { code, text })
}

async fn read_control_line(stream: &mut ControlStream, limit: Duration) -> Result<String> {
    let mut raw = String::new();
    let read = tokio::time::timeout(limit, stream.read_line(&mut raw))
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, "control channel read"))?
        .map_err(unavailable)?;
    if read == 0 {
        return Err(Error::new(ErrorKind::Unavailable, "control connection closed"));
    }
    Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}

/// One authenticated FTP control connection plus everything needed to open
/// data connections.
pub(crate) struct FtpSession {
    control: ControlStream,
    tls: Option<TlsConnector>,
    host: String,
    local_ip: IpAddr,
    passive: bool,
    timeout: Duration,
    features: Features,
}

impl FtpSession {
    /// Connects, optionally upgrades to TLS, logs in, switches to binary mode
    /// and probes the server's capabilities.
    pub(crate) async fn connect(config: &FtpConfig, connection: &ConnectionConfig) -> Result<Self> {
        let limit = Duration::from_secs(connection.timeout_seconds);
        debug!(host = %config.host, port = config.port, "connecting");
        let tcp = tokio::time::timeout(
            limit,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, format!("connecting to {}", config.host)))?
        .map_err(unavailable)?;
        let local_ip = tcp.local_addr().map_err(unavailable)?.ip();

        let mut control: ControlStream = BufStream::new(Box::new(tcp));
        let greeting = read_reply(&mut control, limit).await?;
        if !greeting.is_completion() {
            return Err(translate_reply(greeting));
        }

        let tls = if config.secure {
            write_command(&mut control, "AUTH TLS").await?;
            let reply = read_reply(&mut control, limit).await?;
            if reply.code != 234 {
                return Err(Error::new(
                    ErrorKind::Fatal,
                    format!("server refused AUTH TLS: {} {}", reply.code, reply.text),
                ));
            }
            let connector = tls_connector()?;
            let name = ServerName::try_from(config.host.clone())
                .map_err(|err| Error::new(ErrorKind::Fatal, err))?;
            let plain = control.into_inner();
            let wrapped = tokio::time::timeout(limit, connector.connect(name, plain))
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "TLS handshake"))?
                .map_err(unavailable)?;
            control = BufStream::new(Box::new(wrapped));
            Some(connector)
        } else {
            None
        };

        let mut session = FtpSession {
            control,
            tls,
            host: config.host.clone(),
            local_ip,
            passive: config.passive_mode,
            timeout: limit,
            features: Features::default(),
        };
        session.login(config).await?;
        if config.secure {
            session.expect("PBSZ 0", |r| r.is_completion()).await?;
            session.expect("PROT P", |r| r.is_completion()).await?;
        }
        session.expect("TYPE I", |r| r.is_completion()).await?;
        session.probe_features().await;
        debug!(host = %config.host, port = config.port, "connected");
        Ok(session)
    }

    async fn login(&mut self, config: &FtpConfig) -> Result<()> {
        let user = config.username.as_deref().unwrap_or("anonymous");
        let mut reply = self.command(&format!("USER {}", user)).await?;
        if reply.is_intermediate() {
            let password = config.password.as_deref().unwrap_or("anonymous@");
            reply = self.command(&format!("PASS {}", password)).await?;
        }
        if !reply.is_completion() {
            return Err(Error::new(
                ErrorKind::AuthFailed,
                format!("{} {}", reply.code, reply.text),
            ));
        }
        debug!(user, "logged in");
        Ok(())
    }

    async fn probe_features(&mut self) {
        match self.command("FEAT").await {
            Ok(reply) if reply.is_completion() => {
                self.features = parse_features(&reply.text);
                debug!(
                    mlsd = self.features.mlsd,
                    mlst = self.features.mlst,
                    rest = self.features.rest,
                    "server capabilities"
                );
            }
            Ok(_) | Err(_) => {
                warn!("FEAT probe failed, assuming no optional capabilities");
                self.features = Features::default();
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Reply> {
        write_command(&mut self.control, command).await?;
        read_reply(&mut self.control, self.timeout).await
    }

    async fn expect(&mut self, command: &str, ok: impl Fn(&Reply) -> bool) -> Result<Reply> {
        let reply = self.command(command).await?;
        if ok(&reply) {
            Ok(reply)
        } else {
            Err(translate_reply(reply))
        }
    }

    async fn timed<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(unavailable(err)),
            Err(_) => Err(Error::new(ErrorKind::TimedOut, what)),
        }
    }

    /// Liveness probe used before each operation.
    pub(crate) async fn noop(&mut self) -> Result<()> {
        self.expect("NOOP", |r| r.is_completion()).await.map(|_| ())
    }

    /// Polite goodbye; errors are irrelevant at this point.
    pub(crate) async fn quit(&mut self) {
        if let Err(err) = self.command("QUIT").await {
            debug!(error = %err, "QUIT failed, closing anyway");
        }
    }

    async fn wrap_data(&self, tcp: TcpStream) -> Result<Box<dyn Conn>> {
        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|err| Error::new(ErrorKind::Fatal, err))?;
                let stream = self
                    .timed("TLS handshake on data connection", connector.connect(name, tcp))
                    .await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Opens the data connection for `command` and leaves the final reply
    /// pending; callers finish the transfer with [`Self::finish_transfer`].
    async fn open_data(&mut self, command: &str) -> Result<Box<dyn Conn>> {
        if self.passive {
            let reply = self.command("PASV").await?;
            if reply.code != 227 {
                return Err(translate_reply(reply));
            }
            let addr = parse_pasv(&reply.text).ok_or_else(|| {
                Error::new(ErrorKind::Fatal, format!("unparseable PASV reply: {}", reply.text))
            })?;
            let tcp = self.timed("data connect", TcpStream::connect(addr)).await?;
            let reply = self.command(command).await?;
            if !reply.is_preliminary() && !reply.is_completion() {
                return Err(translate_reply(reply));
            }
            self.wrap_data(tcp).await
        } else {
            let IpAddr::V4(ip) = self.local_ip else {
                return Err(Error::new(ErrorKind::Fatal, "active mode requires IPv4"));
            };
            let listener = TcpListener::bind(SocketAddr::new(self.local_ip, 0))
                .await
                .map_err(unavailable)?;
            let port = listener.local_addr().map_err(unavailable)?.port();
            let o = ip.octets();
            let port_cmd = format!(
                "PORT {},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                port >> 8,
                port & 0xff
            );
            self.expect(&port_cmd, |r| r.is_completion()).await?;
            let reply = self.command(command).await?;
            if !reply.is_preliminary() && !reply.is_completion() {
                return Err(translate_reply(reply));
            }
            let (tcp, _) = self.timed("data accept", listener.accept()).await?;
            self.wrap_data(tcp).await
        }
    }

    async fn finish_transfer(&mut self) -> Result<()> {
        let reply = read_reply(&mut self.control, self.timeout).await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(translate_reply(reply))
        }
    }

    async fn download(&mut self, command: &str) -> Result<Vec<u8>> {
        let mut data = self.open_data(command).await?;
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await.map_err(unavailable)?;
        drop(data);
        self.finish_transfer().await?;
        Ok(buffer)
    }

    async fn upload(&mut self, command: &str, payload: &[u8]) -> Result<()> {
        let mut data = self.open_data(command).await?;
        data.write_all(payload).await.map_err(unavailable)?;
        data.shutdown().await.map_err(unavailable)?;
        drop(data);
        self.finish_transfer().await
    }

    /// Enumerates a directory, structured when the server can, legacy `LIST`
    /// otherwise.
    pub(crate) async fn list_dir(&mut self, dir: &str) -> Result<Vec<FileStats>> {
        let raw = if self.features.mlsd {
            self.download(&format!("MLSD {}", dir)).await?
        } else {
            self.expect(&format!("CWD {}", dir), |r| r.is_completion()).await?;
            self.download("LIST").await?
        };
        let text = String::from_utf8_lossy(&raw);
        let parse = if self.features.mlsd {
            parse_mlsx_line
        } else {
            parse_list_line
        };
        let entries: Vec<FileStats> = text
            .lines()
            .filter_map(parse)
            .filter(|stats| stats.name != "." && stats.name != "..")
            .collect();
        debug!(dir, entries = entries.len(), "listed");
        Ok(entries)
    }

    /// Single-entry metadata: `MLST` when available, otherwise the parent
    /// listing is searched. The root has no parent and is synthesized.
    pub(crate) async fn file_info(&mut self, target: &str) -> Result<FileStats> {
        if target == "/" {
            return Ok(FileStats::dir("/", Utc::now()));
        }
        if self.features.mlst {
            let reply = self.expect(&format!("MLST {}", target), |r| r.code == 250).await?;
            let mut stats = reply
                .text
                .lines()
                .filter_map(parse_mlsx_line)
                .next()
                .ok_or_else(|| {
                    Error::new(ErrorKind::Fatal, format!("unparseable MLST reply for {target}"))
                })?;
            // Servers echo the full request path here; the caller wants the leaf.
            stats.name = path::leaf(target);
            return Ok(stats);
        }
        let name = path::leaf(target);
        let entries = self.list_dir(&path::parent(target)).await?;
        entries
            .into_iter()
            .find(|stats| stats.name == name)
            .ok_or_else(|| Error::from(ErrorKind::NotFound))
    }

    /// Downloads `target`, restarting at `offset` via `REST` when the server
    /// advertises it, slicing client-side otherwise.
    pub(crate) async fn retrieve(&mut self, target: &str, offset: u64) -> Result<Vec<u8>> {
        let mut rest_applied = false;
        if offset > 0 && self.features.rest {
            let reply = self.command(&format!("REST {}", offset)).await?;
            rest_applied = reply.code == 350;
        }
        let mut data = self.download(&format!("RETR {}", target)).await?;
        if offset > 0 && !rest_applied {
            let skip = (offset as usize).min(data.len());
            data.drain(..skip);
        }
        Ok(data)
    }

    /// Uploads `payload` as the complete new content of `target`.
    pub(crate) async fn store(&mut self, target: &str, payload: &[u8]) -> Result<()> {
        self.upload(&format!("STOR {}", target), payload).await
    }

    pub(crate) async fn delete(&mut self, target: &str) -> Result<()> {
        self.expect(&format!("DELE {}", target), |r| r.is_completion())
            .await
            .map(|_| ())
    }

    pub(crate) async fn remove_dir(&mut self, target: &str) -> Result<()> {
        self.expect(&format!("RMD {}", target), |r| r.is_completion())
            .await
            .map(|_| ())
    }

    /// Creates `target`, falling back to creating each missing parent when
    /// the direct `MKD` is refused. An already existing directory is fine; a
    /// refusal for any other reason surfaces from the segment it hit.
    pub(crate) async fn make_dir(&mut self, target: &str) -> Result<()> {
        match self.try_mkd(target).await {
            Ok(()) => return Ok(()),
            // The direct attempt may only have failed because a parent is
            // missing; walk the segments before believing the refusal.
            Err(err) if err.kind().is_transient() => return Err(err),
            Err(_) => {}
        }
        let mut current = String::new();
        for segment in target.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.try_mkd(&current).await?;
        }
        Ok(())
    }

    /// One `MKD`. An "already exists" refusal counts as success; every other
    /// failure reply is translated into the taxonomy.
    async fn try_mkd(&mut self, target: &str) -> Result<()> {
        let reply = self.command(&format!("MKD {}", target)).await?;
        if reply.is_completion() {
            return Ok(());
        }
        let text = reply.text.to_lowercase();
        if text.contains("exists") || text.contains("already") {
            debug!(target, "directory already exists");
            return Ok(());
        }
        Err(translate_reply(reply))
    }

    pub(crate) async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.expect(&format!("RNFR {}", from), |r| r.is_intermediate()).await?;
        self.expect(&format!("RNTO {}", to), |r| r.is_completion())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    async fn stream_with(input: &str) -> ControlStream {
        let (client, mut server) = duplex(4096);
        server.write_all(input.as_bytes()).await.unwrap();
        drop(server);
        BufStream::new(Box::new(client))
    }

    /// A session whose control channel will answer with the scripted replies,
    /// in order. The server half is kept alive so commands have somewhere to
    /// go.
    async fn scripted_session(replies: &str) -> (FtpSession, tokio::io::DuplexStream) {
        let (client, mut server) = duplex(4096);
        server.write_all(replies.as_bytes()).await.unwrap();
        let session = FtpSession {
            control: BufStream::new(Box::new(client)),
            tls: None,
            host: "test".to_string(),
            local_ip: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            passive: true,
            timeout: Duration::from_secs(1),
            features: Features::default(),
        };
        (session, server)
    }

    #[tokio::test]
    async fn make_dir_succeeds_directly() {
        let (mut session, _server) = scripted_session("257 \"/fresh\" created\r\n").await;
        session.make_dir("/fresh").await.unwrap();
    }

    #[tokio::test]
    async fn make_dir_treats_existing_directory_as_success() {
        let (mut session, _server) =
            scripted_session("550 Directory already exists\r\n").await;
        session.make_dir("/present").await.unwrap();
    }

    #[tokio::test]
    async fn make_dir_surfaces_permanent_refusals() {
        // Direct attempt refused, then the first segment of the fallback walk
        // is refused for the same real reason: that must come back as an
        // error, not a silent success.
        let (mut session, _server) = scripted_session(
            "550 Permission denied\r\n550 Permission denied\r\n",
        )
        .await;
        let err = session.make_dir("/forbidden/newdir").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn make_dir_swallows_existing_intermediate_segments() {
        // Direct attempt refused because the parent chain is incomplete; the
        // walk finds /a already there and creates /a/b.
        let (mut session, _server) = scripted_session(
            "550 Cannot create directory\r\n550 Directory already exists\r\n257 \"/a/b\" created\r\n",
        )
        .await;
        session.make_dir("/a/b").await.unwrap();
    }

    #[tokio::test]
    async fn reads_a_single_line_reply() {
        let mut stream = stream_with("220 Service ready\r\n").await;
        let reply = read_reply(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text, "Service ready");
    }

    #[tokio::test]
    async fn reads_a_multiline_reply() {
        let mut stream =
            stream_with("211-Features:\r\n MLSD\r\n REST STREAM\r\n211 End\r\n").await;
        let reply = read_reply(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.text, "Features:\n MLSD\n REST STREAM\nEnd");
        let features = parse_features(&reply.text);
        assert!(features.mlsd && features.rest && !features.mlst);
    }

    #[tokio::test]
    async fn closed_control_connection_is_unavailable() {
        let mut stream = stream_with("").await;
        let err = read_reply(&mut stream, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn garbage_reply_is_fatal() {
        let mut stream = stream_with("ready when you are\r\n").await;
        let err = read_reply(&mut stream, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn commands_are_written_with_crlf() {
        let (client, server) = duplex(4096);
        let mut stream: ControlStream = BufStream::new(Box::new(client));
        write_command(&mut stream, "TYPE I").await.unwrap();
        drop(stream);
        let mut server = tokio::io::BufReader::new(server);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "TYPE I\r\n");
    }

    #[test]
    fn reply_classes() {
        assert!(Reply { code: 150, text: String::new() }.is_preliminary());
        assert!(Reply { code: 226, text: String::new() }.is_completion());
        assert!(Reply { code: 350, text: String::new() }.is_intermediate());
    }

    #[test]
    fn temporary_codes_translate_transient() {
        let err = translate_reply(Reply { code: 450, text: "busy".into() });
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.kind().is_transient());
    }

    #[test]
    fn fivefifty_translates_by_text() {
        let cases = [
            ("file not found", ErrorKind::NotFound),
            ("No such file or directory", ErrorKind::NotFound),
            ("Permission denied", ErrorKind::AccessDenied),
            ("Directory not empty", ErrorKind::NotEmpty),
            ("unhelpful message", ErrorKind::NotFound),
        ];
        for (text, expected) in cases {
            let err = translate_reply(Reply { code: 550, text: text.into() });
            assert_eq!(err.kind(), expected, "550 {text}");
        }
    }

    #[test]
    fn auth_codes_translate_auth_failed() {
        let err = translate_reply(Reply { code: 530, text: "Not logged in".into() });
        assert_eq!(err.kind(), ErrorKind::AuthFailed);
    }
}
