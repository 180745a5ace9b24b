// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::client::{ChunkSink, FetchOutcome, ProbeInfo, SinkFlow, TransferRequest};
use crate::errors::ClientError;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{event, Level};

const DATA_BUFFER: usize = 65_536;

/// Minimal FTP client: control connection plus one passive-mode data
/// connection per transfer. Resume uses REST before RETR; the transfer
/// is resumable exactly when the server accepts the REST (350).
pub struct FtpClient {
    connect_timeout: Duration,
}

struct FtpTarget {
    host: String,
    port: u16,
    username: String,
    password: String,
    path: String,
}

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FtpClient {
    pub fn new(connect_timeout: Duration) -> Self {
        FtpClient { connect_timeout }
    }

    pub async fn probe(&self, request: &TransferRequest) -> Result<ProbeInfo, ClientError> {
        let target = parse_target(request)?;
        let mut control = self.login(&target).await?;

        let mut info = ProbeInfo {
            status: 200,
            final_url: request.url.clone(),
            content_length: -1,
            content_type: "application/octet-stream".to_string(),
            ..Default::default()
        };

        let (code, message) = control.command(&format!("SIZE {}", target.path)).await?;
        if code == 213 {
            info.content_length = message.trim().parse().unwrap_or(-1);
        }

        let (code, message) = control.command(&format!("MDTM {}", target.path)).await?;
        if code == 213 {
            info.last_modified = message.trim().to_string();
        }

        // REST support is the FTP equivalent of range support.
        let (code, _) = control.command("REST 0").await?;
        info.accept_ranges = code == 350;

        let _ = control.command("QUIT").await;
        Ok(info)
    }

    pub async fn fetch<S: ChunkSink>(
        &self,
        request: &TransferRequest,
        sink: &mut S,
    ) -> Result<FetchOutcome, ClientError> {
        let target = parse_target(request)?;
        let mut control = self.login(&target).await?;

        let (code, message) = control.command("PASV").await?;
        if code != 227 {
            return Err(ClientError::Ftp { code, message });
        }
        let (data_addr, data_port) = parse_pasv(&message)?;

        let start = request.range.map(|(s, _)| s).unwrap_or(0);
        if start > 0 {
            let (code, message) = control.command(&format!("REST {start}")).await?;
            if code != 350 {
                // Seek refused: the server cannot resume this file.
                return Err(ClientError::Ftp { code, message });
            }
        }

        let data_stream = timeout(
            self.connect_timeout,
            TcpStream::connect((data_addr, data_port)),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::Connect(e.to_string()))?;

        let (code, message) = control.command(&format!("RETR {}", target.path)).await?;
        if code != 150 && code != 125 {
            return Err(ClientError::Ftp { code, message });
        }

        let mut data_stream = data_stream;
        let mut buffer = vec![0u8; DATA_BUFFER];
        loop {
            let read = match data_stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(ClientError::Reset(e.to_string())),
            };
            if sink.accept(&buffer[..read]).await? == SinkFlow::Stop {
                // Dropping the data socket aborts the transfer; the
                // server notices when its next write fails.
                drop(data_stream);
                let _ = control.command("QUIT").await;
                return Ok(FetchOutcome::Stopped);
            }
        }
        drop(data_stream);

        // 226 transfer complete; tolerate servers that close early.
        if let Ok((code, message)) = control.read_reply().await {
            if code != 226 && code != 250 {
                event!(Level::DEBUG, code, message = %message, "Unexpected RETR completion reply");
            }
        }
        let _ = control.command("QUIT").await;
        Ok(FetchOutcome::Completed)
    }

    async fn login(&self, target: &FtpTarget) -> Result<ControlConnection, ClientError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::Connect(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let mut control = ControlConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let (code, message) = control.read_reply().await?;
        if code != 220 {
            return Err(ClientError::Ftp { code, message });
        }

        let (code, message) = control
            .command(&format!("USER {}", target.username))
            .await?;
        match code {
            230 => {}
            331 => {
                let (code, message) = control
                    .command(&format!("PASS {}", target.password))
                    .await?;
                if code != 230 {
                    return Err(ClientError::Ftp { code, message });
                }
            }
            _ => return Err(ClientError::Ftp { code, message }),
        }

        let (code, message) = control.command("TYPE I").await?;
        if code != 200 {
            return Err(ClientError::Ftp { code, message });
        }

        Ok(control)
    }
}

impl ControlConnection {
    async fn command(&mut self, cmd: &str) -> Result<(u32, String), ClientError> {
        self.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .map_err(|e| ClientError::Reset(e.to_string()))?;
        self.read_reply().await
    }

    /// Read one server reply, collapsing RFC 959 multi-line replies
    /// ("123-..." until a "123 " terminator) into a single message.
    async fn read_reply(&mut self) -> Result<(u32, String), ClientError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ClientError::Reset(e.to_string()))?;
        if read == 0 {
            return Err(ClientError::Reset("control connection closed".to_string()));
        }

        let (code, multiline) = parse_reply_line(&line)?;
        let mut message = reply_text(&line);

        if multiline {
            let terminator = format!("{code} ");
            loop {
                let mut next = String::new();
                let read = self
                    .reader
                    .read_line(&mut next)
                    .await
                    .map_err(|e| ClientError::Reset(e.to_string()))?;
                if read == 0 {
                    return Err(ClientError::Reset("control connection closed".to_string()));
                }
                let ended = next.starts_with(&terminator);
                message.push(' ');
                message.push_str(&reply_text(&next));
                if ended {
                    break;
                }
            }
        }

        Ok((code, message))
    }
}

fn parse_reply_line(line: &str) -> Result<(u32, bool), ClientError> {
    if line.len() < 4 {
        return Err(ClientError::Protocol(format!("short FTP reply: {line:?}")));
    }
    let code: u32 = line[..3]
        .parse()
        .map_err(|_| ClientError::Protocol(format!("bad FTP reply code: {line:?}")))?;
    Ok((code, line.as_bytes()[3] == b'-'))
}

fn reply_text(line: &str) -> String {
    line.get(4..).unwrap_or("").trim_end().to_string()
}

/// Parse "227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)".
fn parse_pasv(message: &str) -> Result<(Ipv4Addr, u16), ClientError> {
    let open = message
        .find('(')
        .ok_or_else(|| ClientError::Protocol(format!("bad PASV reply: {message}")))?;
    let close = message[open..]
        .find(')')
        .map(|p| open + p)
        .ok_or_else(|| ClientError::Protocol(format!("bad PASV reply: {message}")))?;

    let fields: Vec<u16> = message[open + 1..close]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| ClientError::Protocol(format!("bad PASV reply: {message}")))?;
    if fields.len() != 6 || fields.iter().any(|&f| f > 255) {
        return Err(ClientError::Protocol(format!("bad PASV reply: {message}")));
    }

    let addr = Ipv4Addr::new(
        fields[0] as u8,
        fields[1] as u8,
        fields[2] as u8,
        fields[3] as u8,
    );
    Ok((addr, fields[4] * 256 + fields[5]))
}

fn parse_target(request: &TransferRequest) -> Result<FtpTarget, ClientError> {
    let parsed = url::Url::parse(&request.url)
        .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", request.url)))?;
    if parsed.scheme() != "ftp" {
        return Err(ClientError::InvalidUrl(format!(
            "not an ftp url: {}",
            request.url
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl(format!("no host in {}", request.url)))?
        .to_string();

    // Explicit credentials on the request win over URL userinfo.
    let (username, password) = if !request.username.is_empty() {
        (request.username.clone(), request.password.clone())
    } else if !parsed.username().is_empty() {
        (
            parsed.username().to_string(),
            parsed.password().unwrap_or("").to_string(),
        )
    } else {
        ("anonymous".to_string(), "swiftget@".to_string())
    };

    let path = urlencoding::decode(parsed.path())
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| parsed.path().to_string());

    Ok(FtpTarget {
        host,
        port: parsed.port().unwrap_or(21),
        username,
        password,
        path,
    })
}
