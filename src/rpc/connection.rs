//! Client-side connections
//!
//! A connection carries requests to one endpoint. Requests are serialized:
//! the connection lock is held from sending a request until its reply
//! arrives, so replies always match the outstanding request.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::endpoint::Endpoint;
use super::protocol::{Message, ReplyMessage, RequestMessage, ONEWAY_REQUEST_ID};
use super::settings::Settings;
use super::transport::{self, BoxReader, BoxWriter};
use crate::common::{Error, Result};

/// Failure of a single request, remembering whether it reached the wire
#[derive(Debug)]
pub struct RequestFailure {
    pub error: Error,
    /// Whether the request was (possibly) delivered before the failure
    pub sent: bool,
}

impl RequestFailure {
    fn not_sent(error: Error) -> Self {
        Self { error, sent: false }
    }

    fn sent(error: Error) -> Self {
        Self { error, sent: true }
    }
}

struct Io {
    reader: BoxReader,
    writer: BoxWriter,
}

/// An established client connection
pub struct Connection {
    endpoint: Endpoint,
    settings: Arc<Settings>,
    io: Mutex<Option<Io>>,
    closed: AtomicBool,
    next_id: AtomicU32,
}

impl Connection {
    /// Connect to an endpoint and wait for the server's validation message
    pub async fn connect(endpoint: &Endpoint, settings: Arc<Settings>) -> Result<Self> {
        let connect_timeout = settings.override_connect_timeout.or(endpoint.timeout());

        let (mut reader, writer) = with_timeout(connect_timeout, transport::connect(endpoint))
            .await?
            .map_err(|source| Error::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let greeting = with_timeout(
            connect_timeout,
            transport::read_frame(&mut reader, settings.message_size_max),
        )
        .await?
        .map_err(|e| match e {
            Error::Io(io) if transport::is_peer_gone(&io) => {
                Error::ConnectionLost(endpoint.to_string())
            }
            other => other,
        })?;

        if greeting != Message::ValidateConnection {
            return Err(Error::Protocol(format!(
                "expected connection validation from {}, got {:?}",
                endpoint, greeting
            )));
        }

        if settings.trace_network > 0 {
            tracing::info!(endpoint = %endpoint, "Established connection");
        } else {
            tracing::debug!(endpoint = %endpoint, "Established connection");
        }

        Ok(Self {
            endpoint: endpoint.clone(),
            settings,
            io: Mutex::new(Some(Io { reader, writer })),
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the connection has been closed or lost
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != ONEWAY_REQUEST_ID {
                return id;
            }
        }
    }

    /// Send a request and, for twoway requests, wait for its reply
    ///
    /// The request id is assigned here. Oneway requests return `Ok(None)`
    /// as soon as they are written.
    pub async fn send_request(
        &self,
        mut request: RequestMessage,
        twoway: bool,
        timeout: Option<u64>,
    ) -> std::result::Result<Option<ReplyMessage>, RequestFailure> {
        let mut guard = self.io.lock().await;
        let io = match guard.as_mut() {
            Some(io) => io,
            None => {
                return Err(RequestFailure::not_sent(Error::ConnectionClosed(
                    self.endpoint.to_string(),
                )))
            }
        };

        request.request_id = if twoway {
            self.next_request_id()
        } else {
            ONEWAY_REQUEST_ID
        };
        let request_id = request.request_id;

        if self.settings.trace_protocol > 0 {
            tracing::info!(
                endpoint = %self.endpoint,
                request_id,
                operation = %request.operation,
                "Sending request"
            );
        } else {
            tracing::trace!(request = ?request, "Sending request");
        }

        let max = self.settings.message_size_max;
        let sent = with_timeout(
            timeout,
            transport::write_frame(&mut io.writer, &Message::Request(request), max),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(Error::Io(e))) if transport::is_peer_gone(&e) => {
                self.mark_lost(&mut guard);
                return Err(RequestFailure::not_sent(Error::ConnectionLost(
                    self.endpoint.to_string(),
                )));
            }
            Ok(Err(Error::Io(e))) if e.kind() == std::io::ErrorKind::InvalidInput => {
                // Oversized frames are rejected before anything is written
                return Err(RequestFailure::not_sent(Error::Io(e)));
            }
            Ok(Err(Error::Io(e))) => {
                // A partial frame leaves the stream out of sync
                self.mark_lost(&mut guard);
                return Err(RequestFailure::sent(Error::Io(e)));
            }
            Ok(Err(e)) => return Err(RequestFailure::not_sent(e)),
            Err(e) => {
                self.mark_lost(&mut guard);
                return Err(RequestFailure::sent(e));
            }
        }

        if !twoway {
            return Ok(None);
        }

        loop {
            let io = match guard.as_mut() {
                Some(io) => io,
                None => {
                    return Err(RequestFailure::sent(Error::ConnectionLost(
                        self.endpoint.to_string(),
                    )))
                }
            };
            let frame = with_timeout(timeout, transport::read_frame(&mut io.reader, max)).await;
            let message = match frame {
                Ok(Ok(message)) => message,
                Ok(Err(Error::Io(e))) if transport::is_peer_gone(&e) => {
                    self.mark_lost(&mut guard);
                    return Err(RequestFailure::sent(Error::ConnectionLost(
                        self.endpoint.to_string(),
                    )));
                }
                Ok(Err(e)) | Err(e) => {
                    self.mark_lost(&mut guard);
                    return Err(RequestFailure::sent(e));
                }
            };

            match message {
                Message::Reply(reply) if reply.request_id == request_id => {
                    if self.settings.trace_protocol > 0 {
                        tracing::info!(
                            endpoint = %self.endpoint,
                            request_id,
                            status = ?reply.status,
                            "Received reply"
                        );
                    }
                    return Ok(Some(reply));
                }
                Message::Reply(reply) => {
                    tracing::warn!(
                        expected = request_id,
                        got = reply.request_id,
                        "Discarding reply for unknown request"
                    );
                }
                Message::ValidateConnection => {}
                Message::CloseConnection => {
                    self.mark_lost(&mut guard);
                    return Err(RequestFailure::sent(Error::ConnectionClosed(
                        self.endpoint.to_string(),
                    )));
                }
                Message::Request(_) => {
                    self.mark_lost(&mut guard);
                    return Err(RequestFailure::sent(Error::Protocol(
                        "received a request on a client connection".to_string(),
                    )));
                }
            }
        }
    }

    fn mark_lost(&self, io: &mut Option<Io>) {
        io.take();
        if !self.closed.swap(true, Ordering::SeqCst) && self.settings.warn_connections {
            tracing::warn!(endpoint = %self.endpoint, "Connection lost");
        }
    }

    /// Close the connection gracefully
    ///
    /// A peer that already went away is not an error.
    pub async fn close(&self) -> Result<()> {
        let Some(mut io) = self.io.lock().await.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);

        let max = self.settings.message_size_max;
        let close = transport::write_frame(&mut io.writer, &Message::CloseConnection, max).await;
        let result = match close {
            Ok(()) => io.writer.shutdown().await.map_err(Error::Io),
            Err(e) => Err(e),
        };

        match result {
            Err(Error::Io(e)) if transport::is_peer_gone(&e) => {
                tracing::debug!(endpoint = %self.endpoint, "Peer already closed the connection");
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        if self.settings.trace_network > 0 {
            tracing::info!(endpoint = %self.endpoint, "Closed connection");
        } else {
            tracing::debug!(endpoint = %self.endpoint, "Closed connection");
        }
        Ok(())
    }
}

/// Run a future with an optional timeout in milliseconds
pub(crate) async fn with_timeout<F: std::future::Future>(
    timeout: Option<u64>,
    future: F,
) -> Result<F::Output> {
    match timeout {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), future)
            .await
            .map_err(|_| Error::Timeout(ms)),
        None => Ok(future.await),
    }
}
