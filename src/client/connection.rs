use crate::error::{ClientError, IoErrorContext};
use crate::framed::FramedSink;
use crate::logger::Logger;
use crate::protocol::messages::{DaemonError, LoggerField, Msg, TrustedFlag};
use crate::protocol::{
    OpCode, ProtocolVersion, CLIENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, WORKER_MAGIC_1,
    WORKER_MAGIC_2,
};
use crate::serialization::{Deserialize, Serialize};
use crate::settings::ClientSettings;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

const EOF_ERROR: &str = "Nix daemon disconnected unexpectedly (maybe it crashed?)";

/// One decoded message from the daemon's stderr stream.
#[derive(Debug)]
pub(crate) enum Event {
    Write(Vec<u8>),
    Read(u64),
    Error(DaemonError),
    Next(String),
    StartActivity {
        id: u64,
        level: u64,
        activity_type: u64,
        text: String,
        fields: Vec<LoggerField>,
        parent: u64,
    },
    StopActivity(u64),
    Result {
        id: u64,
        result_type: u64,
        fields: Vec<LoggerField>,
    },
    Last,
}

/// Decode a single stderr message.  An unknown tag is a protocol
/// violation: the stream position is lost and the connection must be
/// poisoned by the caller.
pub(crate) async fn read_event<R: AsyncRead + Unpin>(
    from: &mut R,
    version: ProtocolVersion,
) -> Result<Event, ClientError> {
    let tag = u64::deserialize(from, version).await.io_context(EOF_ERROR)?;

    match Msg::try_from(tag)? {
        Msg::Write => Ok(Event::Write(Vec::<u8>::deserialize(from, version).await?)),
        Msg::Read => Ok(Event::Read(u64::deserialize(from, version).await?)),
        Msg::Error => Ok(Event::Error(DaemonError::deserialize(from, version).await?)),
        Msg::Next => Ok(Event::Next(String::deserialize(from, version).await?)),
        Msg::StartActivity => Ok(Event::StartActivity {
            id: u64::deserialize(from, version).await?,
            level: u64::deserialize(from, version).await?,
            activity_type: u64::deserialize(from, version).await?,
            text: String::deserialize(from, version).await?,
            fields: Vec::<LoggerField>::deserialize(from, version).await?,
            parent: u64::deserialize(from, version).await?,
        }),
        Msg::StopActivity => Ok(Event::StopActivity(u64::deserialize(from, version).await?)),
        Msg::Result => Ok(Event::Result {
            id: u64::deserialize(from, version).await?,
            result_type: u64::deserialize(from, version).await?,
            fields: Vec::<LoggerField>::deserialize(from, version).await?,
        }),
        Msg::Last => Ok(Event::Last),
    }
}

fn forward_to_logger(logger: &dyn Logger, event: &Event) {
    match event {
        Event::Next(line) => logger.print_error(line.trim_end_matches('\n')),
        Event::StartActivity {
            id,
            level,
            activity_type,
            text,
            fields,
            parent,
        } => logger.start_activity(*id, *level, *activity_type, text, fields, *parent),
        Event::StopActivity(id) => logger.stop_activity(*id),
        Event::Result {
            id,
            result_type,
            fields,
        } => logger.result(*id, *result_type, fields),
        _ => {}
    }
}

/// One negotiated connection to the daemon.
///
/// A connection is either held exclusively by one caller or idle in
/// the pool.  During framed streaming the producer and the stderr
/// drain run concurrently, but they touch disjoint halves: the
/// producer writes `to`, the drain reads `from`.
pub struct Connection<R, W> {
    pub(crate) from: BufReader<R>,
    pub(crate) to: BufWriter<W>,
    pub(crate) version: ProtocolVersion,
    pub(crate) daemon_nix_version: Option<String>,
    pub(crate) remote_trusts_us: Option<TrustedFlag>,
    pub(crate) start_time: Instant,
    pub(crate) bad: bool,
    /// An operation is mid-exchange.  Set when an op code goes out,
    /// cleared when the exchange concludes; a connection released
    /// while busy was abandoned mid-protocol and must not be reused.
    pub(crate) busy: bool,
    pub(crate) logger: Arc<dyn Logger>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Open a connection over the given transport pair: greeting
    /// handshake, version negotiation, then `set_options`.
    pub async fn open(
        read: R,
        write: W,
        uri: &str,
        settings: &ClientSettings,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, ClientError> {
        let mut conn = Self {
            from: BufReader::new(read),
            to: BufWriter::new(write),
            version: CLIENT_PROTOCOL_VERSION,
            daemon_nix_version: None,
            remote_trusts_us: None,
            start_time: Instant::now(),
            bad: false,
            busy: false,
            logger,
        };

        if let Err(e) = conn.handshake().await {
            return Err(ClientError::OpenConnection {
                uri: uri.to_string(),
                source: Box::new(e),
            });
        }

        conn.set_options(settings).await?;
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<(), ClientError> {
        self.write(&WORKER_MAGIC_1).await?;
        self.flush().await?;

        let magic: u64 = self.read().await?;
        if magic != WORKER_MAGIC_2 {
            return Err(ClientError::InvalidMagic {
                expected: WORKER_MAGIC_2,
                actual: magic,
            });
        }

        let daemon_version = ProtocolVersion::from(self.read::<u64>().await?);
        if daemon_version.major != CLIENT_PROTOCOL_VERSION.major
            || daemon_version.minor < MIN_PROTOCOL_VERSION.minor
        {
            return Err(ClientError::IncompatibleVersion {
                daemon: daemon_version,
                min: MIN_PROTOCOL_VERSION,
                max: CLIENT_PROTOCOL_VERSION,
            });
        }
        self.version = daemon_version;

        self.write(&u64::from(CLIENT_PROTOCOL_VERSION)).await?;

        // Obsolete CPU affinity and reserve-space fields.
        self.write(&0u64).await?;
        self.write(&false).await?;

        if self.version.minor >= 33 {
            self.flush().await?;
            self.daemon_nix_version = Some(self.read::<String>().await?);
        }

        if self.version.minor >= 35 {
            self.remote_trusts_us = self.read::<Option<TrustedFlag>>().await?;
        }

        // Surface any startup error the daemon queued.
        self.drain().await
    }

    /// Push the client's build settings to the daemon.
    pub async fn set_options(&mut self, settings: &ClientSettings) -> Result<(), ClientError> {
        self.send_op(OpCode::SetOptions).await?;
        self.write(&settings.keep_failed).await?;
        self.write(&settings.keep_going).await?;
        self.write(&settings.try_fallback).await?;
        self.write(&settings.verbosity).await?;
        self.write(&settings.max_build_jobs).await?;
        self.write(&settings.max_silent_time).await?;
        self.write(&true).await?; // obsolete useBuildHook
        self.write(&(settings.build_verbosity() as u64)).await?;
        self.write(&0u64).await?; // obsolete log type
        self.write(&0u64).await?; // obsolete print build trace
        self.write(&settings.build_cores).await?;
        self.write(&settings.use_substitutes).await?;

        let overrides = settings.filtered_overrides();
        self.write(&(overrides.len() as u64)).await?;
        for (name, value) in overrides {
            self.write(name).await?;
            self.write(value).await?;
        }

        self.drain().await?;
        self.busy = false;
        Ok(())
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn daemon_nix_version(&self) -> Option<&str> {
        self.daemon_nix_version.as_deref()
    }

    pub fn remote_trusts_us(&self) -> Option<TrustedFlag> {
        self.remote_trusts_us
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn mark_bad(&mut self) {
        self.bad = true;
    }

    /// Mark the current exchange as cleanly concluded.
    pub(crate) fn finish_op(&mut self) {
        self.busy = false;
    }

    pub(crate) async fn send_op(&mut self, op: OpCode) -> Result<(), ClientError> {
        self.busy = true;
        self.write(&(op as u64)).await
    }

    pub(crate) async fn write<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), ClientError> {
        value.serialize(&mut self.to, self.version).await
    }

    pub(crate) async fn read<T: Deserialize>(&mut self) -> Result<T, ClientError> {
        T::deserialize(&mut self.from, self.version).await
    }

    pub(crate) async fn flush(&mut self) -> Result<(), ClientError> {
        self.to.flush().await.io_context("Failed to flush request")
    }

    /// Consume the stderr stream until `LAST` or an error message.
    ///
    /// Log and progress events go to the logger; `WRITE` data goes to
    /// `sink` and `READ` requests are served from `source`.  A remote
    /// error is returned as a value, not an `Err`: the caller decides
    /// when to rethrow, after any cleanup.  Protocol violations are
    /// `Err` and poison the connection on the spot.
    pub async fn process_stderr(
        &mut self,
        mut sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
        mut source: Option<&mut (dyn AsyncRead + Unpin + Send)>,
        flush: bool,
    ) -> Result<Option<DaemonError>, ClientError> {
        if flush {
            self.flush().await?;
        }

        loop {
            let event = match read_event(&mut self.from, self.version).await {
                Ok(event) => event,
                Err(e) => {
                    self.bad = true;
                    return Err(e);
                }
            };

            match event {
                Event::Write(data) => match sink.as_mut() {
                    Some(sink) => sink
                        .write_all(&data)
                        .await
                        .io_context("Failed to write daemon data to sink")?,
                    None => {
                        self.bad = true;
                        return Err(ClientError::MissingSink);
                    }
                },
                Event::Read(len) => {
                    let source = match source.as_mut() {
                        Some(source) => source,
                        None => {
                            self.bad = true;
                            return Err(ClientError::MissingSource);
                        }
                    };
                    // Reply with a single chunk of at most `len` bytes;
                    // a short chunk signals end of input.
                    let mut buf = vec![0u8; len as usize];
                    let n = source
                        .read(&mut buf)
                        .await
                        .io_context("Failed to read from source")?;
                    self.write(&buf[..n]).await?;
                    self.flush().await?;
                }
                Event::Error(err) => return Ok(Some(err)),
                Event::Last => return Ok(None),
                other => forward_to_logger(self.logger.as_ref(), &other),
            }
        }
    }

    /// Flush, consume the stderr stream and rethrow a remote error.
    pub(crate) async fn drain(&mut self) -> Result<(), ClientError> {
        match self.process_stderr(None, None, true).await? {
            Some(err) => {
                // The error terminated the exchange in-band; the stream
                // is positioned at the next operation boundary.
                self.busy = false;
                Err(ClientError::Remote(err))
            }
            None => Ok(()),
        }
    }

    /// Stream a framed payload while draining stderr concurrently.
    ///
    /// The request header must already be written; it is flushed before
    /// the drain starts so the daemon sees it first.  A remote error
    /// observed by the drain makes the producer abort before its next
    /// frame, the terminating zero frame is withheld, the connection is
    /// poisoned and the error is returned exactly once.
    pub(crate) async fn send_framed(
        &mut self,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), ClientError> {
        self.to
            .flush()
            .await
            .io_context("Failed to flush framed request header")?;

        let failure: StdMutex<Option<DaemonError>> = StdMutex::new(None);
        let version = self.version;
        let Self {
            from, to, logger, ..
        } = self;

        let drain = async {
            loop {
                match read_event(from, version).await? {
                    Event::Error(err) => {
                        *failure.lock().unwrap() = Some(err);
                        return Ok(());
                    }
                    Event::Last => return Ok(()),
                    Event::Write(_) => return Err(ClientError::MissingSink),
                    Event::Read(_) => return Err(ClientError::MissingSource),
                    other => forward_to_logger(logger.as_ref(), &other),
                }
            }
        };

        let produce = async {
            let mut sink = FramedSink::new(to, &failure);
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                let n = source
                    .read(&mut buf)
                    .await
                    .io_context("Failed to read framed payload from source")?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n]).await?;
            }
            sink.finish().await
        };

        let (drain_res, produce_res) = tokio::join!(drain, produce);

        if let Some(err) = failure.into_inner().unwrap() {
            self.bad = true;
            return Err(ClientError::Remote(err));
        }
        if drain_res.is_err() || produce_res.is_err() {
            self.bad = true;
        }
        drain_res?;
        produce_res
    }

    /// Copy a raw byte stream straight into the connection, outside of
    /// framing.  Used by the pre-1.25 recursive upload path.
    pub(crate) async fn copy_raw(
        &mut self,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, ClientError> {
        tokio::io::copy(source, &mut self.to)
            .await
            .io_context("Failed to stream data to daemon")
    }
}
