//! Serves a single client exchange.
//!
//! The handler reads one request frame, dispatches on its type, drives the matching
//! operation against the storage backend and writes the response. Any failure after the
//! request frame has been read is reported to the client as one `Error` frame. The
//! connection is closed when the handler returns, on every path.
use std::{
    io::{self, Read, Write},
    thread,
};

use log::{debug, info, warn};

use crate::{
    crypt::Crypter,
    storage::{ResumableReader, RetryPolicy, StorageInteractor},
};

use super::{Message, ProtocolError, ProtocolTransport, StreamSink, pipe};

/// Most entries sent in one `ObjectMeta` frame.
pub const LIST_BATCH_SIZE: usize = 1000;

/// Chunks buffered between the upload feeder and the backend write. A single frame can
/// be up to `MAX_FRAME_SIZE`, so the hand-off holds at most one.
const PIPE_CAPACITY: usize = 1;

/// A failed exchange: the cause plus the short context sent along with it.
#[derive(Debug)]
struct Failure {
    cause: ProtocolError,
    context: &'static str,
}

impl Failure {
    fn is_broken_pipe(&self) -> bool {
        matches!(&self.cause, ProtocolError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

trait Context<T> {
    fn context(self, context: &'static str) -> Result<T, Failure>;
}

impl<T, E: Into<ProtocolError>> Context<T> for Result<T, E> {
    fn context(self, context: &'static str) -> Result<T, Failure> {
        self.map_err(|e| Failure {
            cause: e.into(),
            context,
        })
    }
}

/// Serves one exchange on `stream` and closes it.
pub fn handle_connection<T, S, C>(
    stream: T,
    storage: &S,
    crypter: &C,
    policy: RetryPolicy,
) -> Result<(), ProtocolError>
where
    T: Read + Write + Send,
    S: StorageInteractor + ?Sized,
    C: Crypter + ?Sized,
{
    let mut transport = ProtocolTransport::new(stream);
    let mut exchange = Exchange {
        transport: &mut transport,
        storage,
        crypter,
        policy,
    };

    match exchange.serve() {
        Ok(()) => Ok(()),
        Err(Failure { cause, context }) => {
            warn!("{context}: {cause}");
            if let Err(e) = transport.reply_error(&cause, context) {
                debug!("failed to report error to client: {e}");
            }
            Err(cause)
        }
    }
}

struct Exchange<'a, T, S: ?Sized, C: ?Sized>
where
    T: Read + Write,
{
    transport: &'a mut ProtocolTransport<T>,
    storage: &'a S,
    crypter: &'a C,
    policy: RetryPolicy,
}

impl<T, S, C> Exchange<'_, T, S, C>
where
    T: Read + Write + Send,
    S: StorageInteractor + ?Sized,
    C: Crypter + ?Sized,
{
    fn serve(&mut self) -> Result<(), Failure> {
        let frame = self
            .transport
            .read_frame()
            .context("failed to read request packet")?;

        let request = match frame.decode() {
            Ok(request) => request,
            Err(e @ ProtocolError::UnknownMessageType(_)) => {
                return Err(e).context("wrong request type");
            }
            Err(e) => return Err(e).context("failed to decode request packet"),
        };
        debug!("received client request: {}", request.kind());

        match request {
            Message::Cat {
                name,
                offset,
                decrypt,
            } => self.cat(&name, offset, decrypt),
            Message::Put { name, encrypt } => self.put(&name, encrypt),
            Message::List { prefix } => self.list(&prefix),
            other => {
                Err(ProtocolError::UnexpectedMessage(other.kind())).context("wrong request type")
            }
        }
    }

    fn cat(&mut self, name: &str, offset: i64, decrypt: bool) -> Result<(), Failure> {
        let storage = self.storage;
        let reader = ResumableReader::new(offset, self.policy, move |start| {
            debug!("cat object '{name}' with offset {start}");
            storage.cat_file(name, start)
        });

        let mut content: Box<dyn Read + '_> = Box::new(reader);
        if decrypt {
            debug!("decrypt object '{name}'");
            content = self
                .crypter
                .decrypt(content)
                .context("failed to decrypt object")?;
        }

        let copied = io::copy(&mut content, self.transport.get_mut())
            .and_then(|n| self.transport.get_mut().flush().map(|_| n))
            .context("copy failed to complete")?;
        info!("served '{name}' from offset {offset} ({copied} bytes)");
        Ok(())
    }

    fn put(&mut self, name: &str, encrypt: bool) -> Result<(), Failure> {
        let (mut source, sink) = pipe::pipe(PIPE_CAPACITY);
        let transport = &mut *self.transport;
        let storage = self.storage;
        let crypter = self.crypter;

        let (fed, stored) = thread::scope(|scope| {
            let feeder = scope.spawn(move || feed(transport, sink, crypter, encrypt));

            let stored = storage.put_file(name, &mut source);
            // Unblocks the feeder if the backend stopped reading early.
            drop(source);

            let fed = feeder.join().unwrap_or_else(|_| {
                Err(Failure {
                    cause: io::Error::other("upload feeder panicked").into(),
                    context: "failed to read chunk of data",
                })
            });
            (fed, stored)
        });

        match (fed, stored) {
            // The feeder only breaks the pipe because the backend gave up first.
            (Err(failure), Err(e)) if failure.is_broken_pipe() => {
                return Err(e).context("failed to upload");
            }
            (Err(failure), _) => return Err(failure),
            (Ok(()), stored) => stored.context("failed to upload")?,
        }

        self.transport
            .write_message(&Message::ReadyForQuery)
            .context("failed to upload")?;
        info!("stored '{name}'");
        Ok(())
    }

    fn list(&mut self, prefix: &str) -> Result<(), Failure> {
        let objects = self
            .storage
            .list_path(prefix)
            .context("failed to complete request")?;
        debug!("listed {} objects under '{prefix}'", objects.len());

        for batch in objects.chunks(LIST_BATCH_SIZE) {
            self.transport
                .write_message(&Message::ObjectMeta {
                    entries: batch.to_vec(),
                })
                .context("failed to send object metadata")?;
        }

        self.transport
            .write_message(&Message::ReadyForQuery)
            .context("failed to send object metadata")
    }
}

/// Moves `CopyData` payloads from the client into `sink` until `CommandComplete`.
///
/// The pipe is closed cleanly only when the stream completes; every other exit drops it,
/// which fails the backend write instead of leaving it waiting.
fn feed<T, C>(
    transport: &mut ProtocolTransport<T>,
    sink: pipe::PipeWriter,
    crypter: &C,
    encrypt: bool,
) -> Result<(), Failure>
where
    T: Read + Write,
    C: Crypter + ?Sized,
{
    let mut sink: Box<dyn StreamSink> = if encrypt {
        crypter
            .encrypt(Box::new(sink))
            .context("failed to encrypt")?
    } else {
        Box::new(sink)
    };

    loop {
        let message = transport
            .read_message()
            .context("failed to read chunk of data")?;

        match message {
            Message::CopyData { data } => {
                let written = sink.write(&data).context("failed to write copy data")?;
                if written != data.len() {
                    return Err(ProtocolError::ShortWrite {
                        expected: data.len(),
                        written,
                    })
                    .context("failed to complete request");
                }
            }
            Message::CommandComplete => {
                debug!("closing upload stream");
                return sink.finish().context("failed to close upload stream");
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.kind()))
                    .context("failed to read chunk of data");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::Cursor,
        os::unix::net::UnixStream,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use sha2::{Digest, Sha256};
    use tempdir::TempDir;

    use crate::{
        crypt::{AesGcmCrypter, CryptoKey},
        storage::{
            FileStorage, ObjectInfo, ObjectStream, StorageError, StorageLister, StorageMover,
            StorageReader, StorageWriter,
        },
    };

    use super::*;

    const NO_WAIT: RetryPolicy = RetryPolicy {
        limit: 5,
        backoff: Duration::ZERO,
    };

    /// In-memory backend whose reads can be made to break.
    #[derive(Default)]
    struct MemoryStorage {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        listing: Vec<ObjectInfo>,
        break_reads_after: Option<usize>,
        opened_at: Mutex<Vec<i64>>,
    }

    struct Breaking {
        inner: Cursor<Vec<u8>>,
        remaining: usize,
    }

    impl Read for Breaking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            let max = buf.len().min(self.remaining);
            let n = self.inner.read(&mut buf[..max])?;
            if n > 0 {
                self.remaining -= n;
            }
            Ok(n)
        }
    }

    impl StorageReader for MemoryStorage {
        fn cat_file(&self, name: &str, offset: i64) -> Result<ObjectStream, StorageError> {
            self.opened_at.lock().unwrap().push(offset);
            let data = self
                .objects
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
            let rest = data[offset as usize..].to_vec();
            let stream: ObjectStream = match self.break_reads_after {
                Some(remaining) => Box::new(Breaking {
                    inner: Cursor::new(rest),
                    remaining,
                }),
                None => Box::new(Cursor::new(rest)),
            };
            Ok(stream)
        }
    }

    impl StorageWriter for MemoryStorage {
        fn put_file(&self, name: &str, source: &mut dyn Read) -> Result<(), StorageError> {
            let mut data = Vec::new();
            source
                .read_to_end(&mut data)
                .map_err(|e| StorageError::io("read upload", e))?;
            self.objects.lock().unwrap().insert(name.to_string(), data);
            Ok(())
        }
    }

    impl StorageLister for MemoryStorage {
        fn list_path(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
            Ok(self
                .listing
                .iter()
                .filter(|o| o.path.starts_with(prefix))
                .cloned()
                .collect())
        }

        fn list_failed_multipart_uploads(&self) -> Result<HashMap<String, String>, StorageError> {
            Ok(HashMap::new())
        }
    }

    impl StorageMover for MemoryStorage {
        fn move_object(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn delete_object(&self, _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn abort_multipart_upload(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Runs one exchange against `storage`, returning the client end of the connection.
    fn serve<S, C>(
        storage: Arc<S>,
        crypter: Arc<C>,
    ) -> (
        ProtocolTransport<UnixStream>,
        thread::JoinHandle<Result<(), ProtocolError>>,
    )
    where
        S: StorageInteractor + 'static,
        C: Crypter + 'static,
    {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            handle_connection(server, storage.as_ref(), crypter.as_ref(), NO_WAIT)
        });
        (ProtocolTransport::new(client), handle)
    }

    fn no_crypter() -> Arc<Option<AesGcmCrypter>> {
        Arc::new(None)
    }

    fn read_error(client: &mut ProtocolTransport<UnixStream>) -> (String, String) {
        match client.read_message().unwrap() {
            Message::Error { error, message } => (error, message),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    /// Sends a whole upload. The server may reject it and hang up part way, so only the
    /// request frame itself must get through.
    fn put(
        client: &mut ProtocolTransport<UnixStream>,
        name: &str,
        encrypt: bool,
        chunks: &[&[u8]],
    ) {
        client
            .write_message(&Message::Put {
                name: name.into(),
                encrypt,
            })
            .unwrap();
        for chunk in chunks {
            let _ = client.write_message(&Message::CopyData {
                data: chunk.to_vec(),
            });
        }
        let _ = client.write_message(&Message::CommandComplete);
    }

    #[test]
    fn list_is_batched() {
        let storage = Arc::new(MemoryStorage {
            listing: (0..2500)
                .map(|i| ObjectInfo::new(format!("seg/{i:05}"), i))
                .collect(),
            ..Default::default()
        });
        let (mut client, handle) = serve(storage, no_crypter());

        client
            .write_message(&Message::List {
                prefix: "seg/".into(),
            })
            .unwrap();

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        loop {
            match client.read_message().unwrap() {
                Message::ObjectMeta { entries } => {
                    sizes.push(entries.len());
                    seen.extend(entries);
                }
                Message::ReadyForQuery => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(seen[1234], ObjectInfo::new("seg/01234", 1234));
        assert!(matches!(
            client.read_frame(),
            Err(ProtocolError::ConnectionClosed)
        ));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn empty_list_is_just_ready() {
        let (mut client, handle) = serve(Arc::new(MemoryStorage::default()), no_crypter());
        client
            .write_message(&Message::List {
                prefix: "none".into(),
            })
            .unwrap();

        assert_eq!(client.read_message().unwrap(), Message::ReadyForQuery);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn cat_resumes_through_backend_failures() {
        let data = (0..10_000).map(|i| (i % 241) as u8).collect::<Vec<_>>();
        let storage = Arc::new(MemoryStorage {
            objects: Mutex::new(HashMap::from([("obj".to_string(), data.clone())])),
            break_reads_after: Some(3000),
            ..Default::default()
        });
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        client
            .write_message(&Message::Cat {
                name: "obj".into(),
                offset: 1000,
                decrypt: false,
            })
            .unwrap();

        let mut out = Vec::new();
        client.get_mut().read_to_end(&mut out).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(out, &data[1000..]);
        assert_eq!(
            *storage.opened_at.lock().unwrap(),
            vec![1000, 4000, 7000, 10_000]
        );
    }

    #[test]
    fn cat_missing_object_exhausts_retries() {
        let storage = Arc::new(MemoryStorage::default());
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        client
            .write_message(&Message::Cat {
                name: "missing".into(),
                offset: 0,
                decrypt: false,
            })
            .unwrap();

        let (error, message) = read_error(&mut client);
        assert!(error.contains("5 retries"), "{error}");
        assert_eq!(message, "copy failed to complete");
        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::RetriesExhausted(_))
        ));
        assert_eq!(storage.opened_at.lock().unwrap().len(), 5);
    }

    #[test]
    fn unknown_request_type_gets_one_error() {
        let (mut client, handle) = serve(Arc::new(MemoryStorage::default()), no_crypter());

        let mut raw = 12_u64.to_be_bytes().to_vec();
        raw.extend_from_slice(&[7, 0, 0, 0]);
        client.get_mut().write_all(&raw).unwrap();

        let (_, message) = read_error(&mut client);
        assert_eq!(message, "wrong request type");
        assert!(matches!(
            client.read_frame(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn response_type_as_request_is_rejected() {
        let (mut client, handle) = serve(Arc::new(MemoryStorage::default()), no_crypter());
        client.write_message(&Message::ReadyForQuery).unwrap();

        let (_, message) = read_error(&mut client);
        assert_eq!(message, "wrong request type");
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn put_preserves_chunk_order() {
        let temp = TempDir::new("put").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        let input = (0..300_000_u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect::<Vec<_>>();
        let chunks = input.chunks(4099).collect::<Vec<_>>();
        put(&mut client, "seg/obj", false, &chunks);

        assert_eq!(client.read_message().unwrap(), Message::ReadyForQuery);
        handle.join().unwrap().unwrap();

        let mut stored = Vec::new();
        storage
            .cat_file("seg/obj", 0)
            .unwrap()
            .read_to_end(&mut stored)
            .unwrap();
        assert_eq!(Sha256::digest(&stored), Sha256::digest(&input));
    }

    #[test]
    fn encrypted_put_then_decrypted_cat() {
        let temp = TempDir::new("crypt").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let crypter = Arc::new(AesGcmCrypter::new(CryptoKey::derive(b"key").unwrap()));
        let input = vec![42_u8; 200_000];

        let (mut client, handle) = serve(Arc::clone(&storage), Arc::clone(&crypter));
        put(&mut client, "secret", true, &[&input[..150_000], &input[150_000..]]);
        assert_eq!(client.read_message().unwrap(), Message::ReadyForQuery);
        handle.join().unwrap().unwrap();

        let mut raw = Vec::new();
        storage
            .cat_file("secret", 0)
            .unwrap()
            .read_to_end(&mut raw)
            .unwrap();
        assert_ne!(raw, input);

        let (mut client, handle) = serve(Arc::clone(&storage), crypter);
        client
            .write_message(&Message::Cat {
                name: "secret".into(),
                offset: 0,
                decrypt: true,
            })
            .unwrap();
        let mut out = Vec::new();
        client.get_mut().read_to_end(&mut out).unwrap();
        handle.join().unwrap().unwrap();

        assert_eq!(out, input);
    }

    #[test]
    fn encrypt_without_key_is_refused() {
        let temp = TempDir::new("nokey").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        put(&mut client, "obj", true, &[b"data"]);

        let (error, message) = read_error(&mut client);
        assert_eq!(error, "transport io error: encryption is not configured");
        assert_eq!(message, "failed to encrypt");
        assert!(handle.join().unwrap().is_err());
        assert!(storage.list_path("").unwrap().is_empty());
    }

    #[test]
    fn backend_rejection_wins_over_broken_feeder() {
        let temp = TempDir::new("reject").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        let chunk = vec![9_u8; 4096];
        put(&mut client, "../escape", false, &[&chunk, &chunk, &chunk, &chunk]);

        let (error, message) = read_error(&mut client);
        assert_eq!(
            error,
            "invalid object key '../escape': parent directory references"
        );
        assert_eq!(message, "failed to upload");
        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::Backend(StorageError::InvalidKey { .. }))
        ));
        assert!(storage.list_path("").unwrap().is_empty());
    }

    /// Accepts only half of every write.
    struct HalfSink(Box<dyn StreamSink>);

    impl Write for HalfSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(&buf[..buf.len() / 2])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StreamSink for HalfSink {
        fn finish(self: Box<Self>) -> io::Result<()> {
            self.0.finish()
        }
    }

    struct HalfCrypter;

    impl Crypter for HalfCrypter {
        fn encrypt(&self, sink: Box<dyn StreamSink>) -> io::Result<Box<dyn StreamSink>> {
            Ok(Box::new(HalfSink(sink)))
        }

        fn decrypt<'a>(&self, source: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
            Ok(source)
        }
    }

    #[test]
    fn short_write_aborts_without_hanging() {
        let temp = TempDir::new("short").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let (mut client, handle) = serve(Arc::clone(&storage), Arc::new(HalfCrypter));

        client
            .write_message(&Message::Put {
                name: "obj".into(),
                encrypt: true,
            })
            .unwrap();
        client
            .write_message(&Message::CopyData {
                data: vec![1; 10],
            })
            .unwrap();

        let (error, _) = read_error(&mut client);
        assert_eq!(error, "short write: 5 of 10 bytes");
        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::ShortWrite {
                expected: 10,
                written: 5
            })
        ));
        assert!(storage.list_path("").unwrap().is_empty());
        assert!(storage.list_failed_multipart_uploads().unwrap().is_empty());
    }

    #[test]
    fn client_disconnect_mid_upload_discards_object() {
        let temp = TempDir::new("disconnect").unwrap();
        let storage = Arc::new(FileStorage::open(temp.path()).unwrap());
        let (mut client, handle) = serve(Arc::clone(&storage), no_crypter());

        client
            .write_message(&Message::Put {
                name: "obj".into(),
                encrypt: false,
            })
            .unwrap();
        client
            .write_message(&Message::CopyData {
                data: vec![1; 64],
            })
            .unwrap();
        drop(client);

        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(storage.list_path("").unwrap().is_empty());
    }
}
