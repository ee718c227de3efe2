//! Transport layer
//!
//! TCP endpoints use tokio sockets; local endpoints use Unix domain sockets
//! (Unix/macOS) or named pipes (Windows) through the interprocess crate.
//! Both are reduced to a boxed reader/writer pair carrying length-prefixed
//! JSON frames.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::endpoint::Endpoint;
use super::protocol::Message;
use crate::common::{Error, Result};

/// Default maximum message size (1 MB)
pub const DEFAULT_MESSAGE_SIZE_MAX: u32 = 1024 * 1024;

// Platform-specific imports and type aliases
#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

/// Read side of a connection
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of a connection
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open a connection to an endpoint
pub async fn connect(endpoint: &Endpoint) -> io::Result<(BoxReader, BoxWriter)> {
    match endpoint {
        Endpoint::Tcp { host, port, .. } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Endpoint::Local { path, .. } => {
            let stream = connect_local(path).await?;
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

async fn connect_local(path: &str) -> io::Result<Stream> {
    #[cfg(unix)]
    let stream = {
        let name = path.to_fs_name::<GenericFilePath>()?;
        Stream::connect(name).await?
    };

    #[cfg(windows)]
    let stream = {
        let name = path.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(name).await?
    };

    Ok(stream)
}

/// Listener accepting incoming connections for an object adapter
pub enum Listener {
    Tcp(TcpListener),
    Local { listener: platform::Listener, path: String },
}

impl Listener {
    /// Bind to an endpoint
    ///
    /// Returns the listener and the endpoint clients should use, with an
    /// ephemeral TCP port resolved.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp { host, port, .. } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let bound = listener.local_addr()?.port();
                Ok((Self::Tcp(listener), endpoint.with_port(bound)))
            }
            Endpoint::Local { path, .. } => {
                let listener = bind_local(path)?;
                Ok((
                    Self::Local {
                        listener,
                        path: path.clone(),
                    },
                    endpoint.clone(),
                ))
            }
        }
    }

    /// Accept the next connection
    ///
    /// Returns the connection halves and a description of the peer.
    pub async fn accept(&self) -> io::Result<(BoxReader, BoxWriter, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer), peer.to_string()))
            }
            Self::Local { listener, path } => {
                use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
                let stream = ListenerTrait::accept(listener).await?;
                let (reader, writer) = tokio::io::split(stream);
                Ok((Box::new(reader), Box::new(writer), path.clone()))
            }
        }
    }

    /// Release the listener, removing the socket file of local endpoints
    pub fn close(self) -> io::Result<()> {
        match self {
            Self::Tcp(_) => Ok(()),
            Self::Local { listener, path } => {
                drop(listener);
                remove_socket_file(&path)
            }
        }
    }
}

#[cfg(unix)]
fn bind_local(path: &str) -> io::Result<platform::Listener> {
    // A stale socket file from a crashed server would make bind fail
    remove_socket_file(path)?;
    let name = path.to_fs_name::<GenericFilePath>()?;
    let listener = ListenerOptions::new().name(name).create_tokio()?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    Ok(listener)
}

#[cfg(windows)]
fn bind_local(path: &str) -> io::Result<platform::Listener> {
    let name = path.to_ns_name::<GenericNamespaced>()?;
    ListenerOptions::new().name(name).create_tokio()
}

#[cfg(unix)]
fn remove_socket_file(path: &str) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(windows)]
fn remove_socket_file(_path: &str) -> io::Result<()> {
    // Named pipes are automatically cleaned up on Windows
    Ok(())
}

/// Send a length-prefixed message
pub async fn send_message<W: AsyncWriteExt + Unpin + ?Sized>(
    writer: &mut W,
    data: &[u8],
    max_size: u32,
) -> io::Result<()> {
    if data.len() > max_size as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Message too large: {} bytes", data.len()),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed message
pub async fn recv_message<R: AsyncReadExt + Unpin + ?Sized>(
    reader: &mut R,
    max_size: u32,
) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Serialize and send one protocol message
pub async fn write_frame<W: AsyncWriteExt + Unpin + ?Sized>(
    writer: &mut W,
    message: &Message,
    max_size: u32,
) -> Result<()> {
    let json = serde_json::to_vec(message)?;
    send_message(writer, &json, max_size).await?;
    Ok(())
}

/// Receive and deserialize one protocol message
pub async fn read_frame<R: AsyncReadExt + Unpin + ?Sized>(
    reader: &mut R,
    max_size: u32,
) -> Result<Message> {
    let data = recv_message(reader, max_size).await?;
    serde_json::from_slice(&data).map_err(|e| Error::Protocol(format!("Invalid message: {}", e)))
}

/// Whether an I/O error means the peer is already gone
pub fn is_peer_gone(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_message_framing() {
        let mut output = Vec::new();
        send_message(&mut output, b"{\"type\":\"close_connection\"}", DEFAULT_MESSAGE_SIZE_MAX)
            .await
            .unwrap();
        assert_eq!(&output[..4], &27u32.to_le_bytes());

        let mut reader = Cursor::new(output);
        let message = read_frame(&mut reader, DEFAULT_MESSAGE_SIZE_MAX).await.unwrap();
        assert_eq!(message, Message::CloseConnection);
    }

    #[tokio::test]
    async fn test_oversized_messages_are_rejected() {
        let mut output = Vec::new();
        let err = send_message(&mut output, &[0u8; 16], 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let mut frame = 64u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 64]);
        let err = recv_message(&mut Cursor::new(frame), 32).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_error() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{x}");
        let result = read_frame(&mut Cursor::new(frame), DEFAULT_MESSAGE_SIZE_MAX).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_tcp_bind_resolves_ephemeral_port() {
        let endpoint = Endpoint::parse("tcp -h 127.0.0.1 -p 0").unwrap();
        let (listener, published) = Listener::bind(&endpoint).await.unwrap();
        match &published {
            Endpoint::Tcp { port, .. } => assert_ne!(*port, 0),
            other => panic!("Expected tcp endpoint, got {other}"),
        }

        let client = tokio::spawn({
            let published = published.clone();
            async move { connect(&published).await.map(|_| ()) }
        });
        let (_reader, _writer, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        client.await.unwrap().unwrap();
        listener.close().unwrap();
    }
}
