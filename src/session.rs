mod chunks;
pub(crate) mod progress;

use crate::{
    blob::{BlobStore, PayloadHandle},
    error::{FailureKind, TransferError},
};
use bytes::Bytes;
use chunks::Chunks;
use futures::{Stream, StreamExt};
#[cfg(feature = "render_progress")]
use indicatif::ProgressBar;
use once_cell::sync::OnceCell;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "render_progress")]
pub use progress::Progress;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

type StartedFn = Box<dyn FnMut(&Session) + Send>;
type ProgressFn = Box<dyn FnMut(&Session, u8) + Send>;
type SuccessFn = Box<dyn FnMut(&Session, &PayloadHandle, Option<&str>) + Send>;
type FailedFn = Box<dyn FnMut(&Session, FailureKind, &str) + Send>;

/// Per-transfer request headers and callbacks.
///
/// Every callback receives the session driving the transfer, so any of them
/// may call [`Session::stop`].
#[derive(Default)]
pub struct TransferOptions {
    headers: HeaderMap,
    started: Option<StartedFn>,
    progress: Option<ProgressFn>,
    success: Option<SuccessFn>,
    failed: Option<FailedFn>,
    #[cfg(feature = "render_progress")]
    bar: Option<ProgressBar>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransferError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| TransferError::InvalidHeader)?;
        let value = HeaderValue::from_str(value).map_err(|_| TransferError::InvalidHeader)?;
        self.headers.insert(name, value);
        Ok(self)
    }
    pub fn on_started(mut self, f: impl FnMut(&Session) + Send + 'static) -> Self {
        self.started = Some(Box::new(f));
        self
    }
    /// Called after every chunk with the rounded percentage received, only when
    /// the server advertised a content length.
    pub fn on_progress(mut self, f: impl FnMut(&Session, u8) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }
    pub fn on_success(mut self, f: impl FnMut(&Session, &PayloadHandle, Option<&str>) + Send + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }
    pub fn on_failed(mut self, f: impl FnMut(&Session, FailureKind, &str) + Send + 'static) -> Self {
        self.failed = Some(Box::new(f));
        self
    }
    #[cfg(feature = "render_progress")]
    pub fn with_progress_bar(mut self, progress: Progress) -> Self {
        self.bar = Some(progress.bar());
        self
    }
    fn report(&mut self, session: &Session, percent: u8) {
        #[cfg(feature = "render_progress")]
        if let Some(bar) = &self.bar {
            bar.set_position(percent as u64);
        }
        if let Some(progress) = self.progress.as_mut() {
            progress(session, percent);
        }
    }
    fn succeed(&mut self, session: &Session, handle: &PayloadHandle, content_type: Option<&str>) {
        #[cfg(feature = "render_progress")]
        if let Some(bar) = &self.bar {
            bar.finish();
        }
        if let Some(success) = self.success.as_mut() {
            success(session, handle, content_type);
        }
    }
    fn fail(&mut self, session: &Session, error: &TransferError) {
        #[cfg(feature = "render_progress")]
        if let Some(bar) = &self.bar {
            bar.abandon();
        }
        if let Some(failed) = self.failed.as_mut() {
            failed(session, error.kind(), &error.to_string());
        }
    }
}

pub struct SessionBuilder {
    client: Option<ClientWithMiddleware>,
    store: Option<BlobStore>,
    default_headers: HeaderMap,
    connect_timeout: Duration,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            client: None,
            store: None,
            default_headers: HeaderMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SessionBuilder {
    pub fn with_client(mut self, client: ClientWithMiddleware) -> Self {
        self.client = Some(client);
        self
    }
    pub fn with_store(mut self, store: BlobStore) -> Self {
        self.store = Some(store);
        self
    }
    /// Headers sent with every transfer; per-transfer headers of the same name win.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }
    /// Ignored when a client is supplied through [`SessionBuilder::with_client`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    pub fn build(self) -> Session {
        let client = match self.client {
            Some(client) => OnceCell::with_value(client),
            None => OnceCell::new(),
        };
        Session {
            inner: Arc::new(Inner {
                client,
                connect_timeout: self.connect_timeout,
                default_headers: self.default_headers,
                store: self.store.unwrap_or_else(BlobStore::global),
                state: Mutex::default(),
            }),
        }
    }
}

/// Drives one cancellable download at a time and owns the payload handle it
/// produced.
///
/// Clones share state, so a clone can stop a transfer another task is awaiting.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    client: OnceCell<ClientWithMiddleware>,
    connect_timeout: Duration,
    default_headers: HeaderMap,
    store: BlobStore,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    active: Option<Active>,
    payload: Option<PayloadHandle>,
    generation: u64,
}

struct Active {
    generation: u64,
    token: CancellationToken,
}

/// Marks the session active for as long as a transfer runs, including when the
/// `start` future is dropped early.
struct ActiveTransfer<'a> {
    session: &'a Session,
    generation: u64,
    token: CancellationToken,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        let mut state = self.session.state();
        if state.active.as_ref().is_some_and(|active| active.generation == self.generation) {
            state.active = None;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::builder().build()
    }
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }
    pub fn is_active(&self) -> bool {
        self.state().active.is_some()
    }
    /// Handle from the most recent successful transfer, unless released since.
    pub fn payload(&self) -> Option<PayloadHandle> {
        self.state().payload.clone()
    }
    pub fn store(&self) -> &BlobStore {
        &self.inner.store
    }

    /// Downloads `url` into a new in-memory blob.
    ///
    /// Fails with [`TransferError::Busy`] if this session already has a transfer
    /// in flight. Every failure is reported to the `failed` callback and then
    /// returned.
    pub async fn start(&self, url: impl AsRef<str>, mut options: TransferOptions) -> Result<PayloadHandle, TransferError> {
        let transfer = self.begin(&mut options)?;
        let result = self.transfer(url.as_ref(), &mut options, &transfer.token).await;
        self.settle(transfer, options, result)
    }

    /// Cancels the active transfer and releases the payload handle. No-op when idle.
    pub fn stop(&self) {
        let payload = {
            let mut state = self.state();
            if let Some(active) = state.active.take() {
                log::debug!("Cancelling transfer {}", active.generation);
                active.token.cancel();
            }
            state.payload.take()
        };
        if let Some(payload) = payload {
            payload.revoke();
        }
    }

    /// Final teardown: stops, then makes sure no payload handle survives.
    pub fn cleanup(&self) {
        self.stop();
        let payload = self.state().payload.take();
        if let Some(payload) = payload {
            payload.revoke();
        }
    }

    fn begin(&self, options: &mut TransferOptions) -> Result<ActiveTransfer<'_>, TransferError> {
        let begun = {
            let mut state = self.state();
            if state.active.is_some() {
                None
            } else {
                state.generation += 1;
                let generation = state.generation;
                let token = CancellationToken::new();
                state.active = Some(Active {
                    generation,
                    token: token.clone(),
                });
                Some((generation, token))
            }
        };
        let Some((generation, token)) = begun else {
            let error = TransferError::Busy;
            options.fail(self, &error);
            return Err(error);
        };
        if let Some(started) = options.started.as_mut() {
            started(self);
        }
        Ok(ActiveTransfer {
            session: self,
            generation,
            token,
        })
    }

    fn settle(
        &self,
        transfer: ActiveTransfer<'_>,
        mut options: TransferOptions,
        result: Result<(PayloadHandle, Option<String>), TransferError>,
    ) -> Result<PayloadHandle, TransferError> {
        drop(transfer);
        match result {
            Ok((handle, content_type)) => {
                options.succeed(self, &handle, content_type.as_deref());
                Ok(handle)
            }
            Err(error) => {
                log::debug!("Transfer failed: {error}");
                options.fail(self, &error);
                Err(error)
            }
        }
    }

    async fn transfer(
        &self,
        url: &str,
        options: &mut TransferOptions,
        token: &CancellationToken,
    ) -> Result<(PayloadHandle, Option<String>), TransferError> {
        let client = self.client()?;
        let mut headers = self.inner.default_headers.clone();
        headers.extend(std::mem::take(&mut options.headers));

        log::debug!("Requesting {url}");
        let request = client.get(url).headers(headers).send();
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransferError::Aborted),
            response = request => response?,
        };
        let status = response.status();
        log::debug!("{url} responded with {status}");
        if !status.is_success() {
            return Err(TransferError::Status(status));
        }
        let total = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let chunks = self.read_body(response.bytes_stream(), total, options, token).await?;
        let handle = self.publish(chunks, content_type.clone(), token)?;
        Ok((handle, content_type))
    }

    async fn read_body<S, E>(
        &self,
        stream: S,
        total: Option<u64>,
        options: &mut TransferOptions,
        token: &CancellationToken,
    ) -> Result<Chunks, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        TransferError: From<E>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut chunks = Chunks::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransferError::Aborted),
                next = stream.next() => next,
            };
            let Some(chunk) = next.transpose()? else {
                break;
            };
            let received = chunks.push(chunk);
            if let Some(percent) = progress::percent(received, total) {
                options.report(self, percent);
            }
        }
        log::debug!("Stream finished after {} bytes (advertised {total:?})", chunks.received());
        Ok(chunks)
    }

    fn publish(&self, chunks: Chunks, content_type: Option<String>, token: &CancellationToken) -> Result<PayloadHandle, TransferError> {
        if token.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        let previous = self.state().payload.take();
        if let Some(previous) = previous {
            previous.revoke();
        }
        let handle = self.inner.store.create(chunks.assemble(), content_type)?;
        {
            let mut state = self.state();
            if token.is_cancelled() {
                drop(state);
                handle.revoke();
                return Err(TransferError::Aborted);
            }
            state.payload = Some(handle.clone());
        }
        log::info!("Published {} as {}", handle.len().unwrap_or_default(), handle.url());
        Ok(handle)
    }

    fn client(&self) -> Result<&ClientWithMiddleware, TransferError> {
        self.inner.client.get_or_try_init(|| {
            let client = reqwest::ClientBuilder::new()
                .connect_timeout(self.inner.connect_timeout)
                .build()
                .map_err(TransferError::ReqwestError)?;
            Ok::<_, TransferError>(ClientBuilder::new(client).build())
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Starts downloading `url` on the current Tokio runtime and hands back the
/// session right away so the caller can `stop` it.
///
/// Failures still reach the `failed` callback, after which the session is
/// cleaned up; nothing is propagated further.
pub fn start_download_from(url: impl Into<String>, options: TransferOptions) -> Session {
    let session = Session::new();
    let url = url.into();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            let task = session.clone();
            runtime.spawn(async move {
                if let Err(error) = task.start(&url, options).await {
                    log::debug!("Background transfer of {url} failed: {error}");
                    task.cleanup();
                }
            });
        }
        Err(_) => {
            let mut options = options;
            let error = TransferError::Runtime;
            log::debug!("Background transfer of {url} failed: {error}");
            options.fail(&session, &error);
            session.cleanup();
        }
    }
    session
}
