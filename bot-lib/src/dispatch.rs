use crate::{
    actor::{Confined, StateClosed},
    backoff::BackoffPolicy,
    data::PoiseContext,
    ratelimit::{Ledger, RateLimitCheck},
};
use parking_lot::RwLock;
use poise::serenity_prelude::{
    ChannelId, ComponentInteraction, CreateMessage, EditMessage, Http, Message, MessageId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use serenity::http::HttpError;
use std::{
    fmt::{self, Debug, Display},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[serde_as]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Pause before the one last attempt once retries are used up.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub final_grace: Duration,
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            final_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How a failed outbound call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 429. Wait for the hint (or the current delay) and try again.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx or the request never made it. Back off and try again.
    Transient,
    /// Bad request, missing permissions, unknown object.
    NonRetryable,
}

pub trait ClassifyError {
    fn classify(&self) -> ErrorClass;
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited { retry_after: None },
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::NonRetryable,
    }
}

/// Serenity's own ratelimiter reads the `Retry-After` header and waits out
/// route buckets before a request is sent, and its `ErrorResponse` doesn't
/// keep the header. A 429 that still comes back here therefore has no hint
/// and falls back to the current backoff delay. Hints only reach the
/// dispatcher from actions whose error type carries one.
impl ClassifyError for serenity::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
                classify_status(response.status_code.as_u16())
            }
            serenity::Error::Http(HttpError::Request(_)) | serenity::Error::Io(_) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::NonRetryable,
        }
    }
}

/// True when discord answered 404, ie. the thing is already gone.
pub fn is_not_found(error: &serenity::Error) -> bool {
    matches!(
        error,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

#[derive(Error, Debug)]
pub enum DispatchError<E> {
    #[error("request rejected: {0}")]
    Rejected(E),
    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("throttled locally: {0:?}")]
    Throttled(RateLimitCheck),
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error(transparent)]
    Closed(#[from] StateClosed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Send,
    Edit,
    /// Creating, deleting or reconfiguring channels and members.
    Manage,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Send => "send",
            ActionKind::Edit => "edit",
            ActionKind::Manage => "manage",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchStats {
    pub sent: u64,
    pub edited: u64,
    pub managed: u64,
    pub rate_limited: u64,
    pub throttled: u64,
    pub retries: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    edited: AtomicU64,
    managed: AtomicU64,
    rate_limited: AtomicU64,
    throttled: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn success(&self, kind: ActionKind) {
        Self::bump(match kind {
            ActionKind::Send => &self.sent,
            ActionKind::Edit => &self.edited,
            ActionKind::Manage => &self.managed,
        });
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            sent: self.sent.load(Ordering::Relaxed),
            edited: self.edited.load(Ordering::Relaxed),
            managed: self.managed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Who triggered an outbound action, resolved once where the event comes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub user: UserId,
    pub channel: ChannelId,
}

impl From<PoiseContext<'_>> for Origin {
    fn from(ctx: PoiseContext<'_>) -> Self {
        Self {
            user: ctx.author().id,
            channel: ctx.channel_id(),
        }
    }
}

impl From<&ComponentInteraction> for Origin {
    fn from(interaction: &ComponentInteraction) -> Self {
        Self {
            user: interaction.user.id,
            channel: interaction.channel_id,
        }
    }
}

impl From<&Message> for Origin {
    fn from(message: &Message) -> Self {
        Self {
            user: message.author.id,
            channel: message.channel_id,
        }
    }
}

/// Runs outbound calls with retries, backoff and optional local rate limits.
///
/// An action either succeeds, is rejected outright, or runs out of attempts;
/// it's never dropped silently.
#[derive(Clone)]
pub struct Dispatcher {
    retry: Arc<RwLock<RetryConfig>>,
    counters: Arc<Counters>,
    ledger: Option<Confined<Ledger>>,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(retry: RetryConfig, token: CancellationToken) -> Self {
        Self {
            retry: Arc::new(RwLock::new(retry)),
            counters: Arc::default(),
            ledger: None,
            token,
        }
    }

    pub fn with_ledger(mut self, ledger: Confined<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn ledger(&self) -> Option<&Confined<Ledger>> {
        self.ledger.as_ref()
    }

    pub fn set_retry_config(&self, retry: RetryConfig) {
        *self.retry.write() = retry;
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub async fn send<T, E, F, Fut>(
        &self,
        kind: ActionKind,
        mut action: F,
    ) -> Result<T, DispatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + Display,
    {
        let retry = *self.retry.read();
        let policy = retry.backoff;
        let mut delay = policy.initial;
        let mut attempts = 0;

        while attempts < retry.max_attempts {
            if self.token.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            attempts += 1;

            let error = match action().await {
                Ok(value) => {
                    self.counters.success(kind);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let wait = match error.classify() {
                ErrorClass::RateLimited { retry_after } => {
                    Counters::bump(&self.counters.rate_limited);
                    let wait = policy.with_hint(retry_after, delay);
                    tracing::warn!("Rate limited during {kind}, waiting {wait:?}");
                    wait
                }
                ErrorClass::Transient => {
                    Counters::bump(&self.counters.retries);
                    tracing::warn!("{kind} failed ({error}), retrying in {delay:?}");
                    let wait = delay;
                    delay = policy.next_delay(delay);
                    wait
                }
                ErrorClass::NonRetryable => {
                    Counters::bump(&self.counters.errors);
                    tracing::error!("{kind} rejected: {error}");
                    return Err(DispatchError::Rejected(error));
                }
            };

            if !self.sleep(wait).await {
                return Err(DispatchError::Cancelled);
            }
        }

        tracing::warn!("All {attempts} attempts at {kind} failed, making a final attempt");
        if !self.sleep(retry.final_grace).await {
            return Err(DispatchError::Cancelled);
        }

        match action().await {
            Ok(value) => {
                self.counters.success(kind);
                Ok(value)
            }
            Err(error) => {
                Counters::bump(&self.counters.errors);
                tracing::error!("Final {kind} attempt failed: {error}");

                if error.classify() == ErrorClass::NonRetryable {
                    return Err(DispatchError::Rejected(error));
                }

                Err(DispatchError::Exhausted {
                    attempts: attempts + 1,
                    last: error,
                })
            }
        }
    }

    /// [`Dispatcher::send`], after checking and recording `origin` against
    /// the rate limit ledger.
    pub async fn send_gated<T, E, F, Fut>(
        &self,
        origin: Origin,
        kind: ActionKind,
        action: F,
    ) -> Result<T, DispatchError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + Display,
    {
        if let Some(ledger) = &self.ledger {
            let check = ledger.check_and_record(origin.user, origin.channel).await?;

            if check.is_limited() {
                Counters::bump(&self.counters.throttled);
                tracing::debug!("{origin:?} throttled: {check:?}");
                return Err(DispatchError::Throttled(check));
            }
        }

        self.send(kind, action).await
    }

    pub async fn send_message(
        &self,
        http: &Http,
        channel: ChannelId,
        message: CreateMessage,
    ) -> Result<Message, DispatchError<serenity::Error>> {
        self.send(ActionKind::Send, || {
            let message = message.clone();
            async move { channel.send_message(http, message).await }
        })
        .await
    }

    /// Opens a DM channel with `user` and sends `message` there.
    pub async fn send_dm(
        &self,
        http: &Http,
        user: UserId,
        message: CreateMessage,
    ) -> Result<Message, DispatchError<serenity::Error>> {
        let dm = self
            .send(ActionKind::Send, || user.create_dm_channel(http))
            .await?;

        self.send_message(http, dm.id, message).await
    }

    pub async fn edit_message(
        &self,
        http: &Http,
        channel: ChannelId,
        message_id: MessageId,
        edit: EditMessage,
    ) -> Result<Message, DispatchError<serenity::Error>> {
        self.send(ActionKind::Edit, || {
            let edit = edit.clone();
            async move { channel.edit_message(http, message_id, edit).await }
        })
        .await
    }

    /// False when shutdown interrupted the wait.
    async fn sleep(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ratelimit::RateLimitConfig, tasks::TaskSupervisor};
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    struct Status(u16, Option<u64>);

    impl Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "status {}", self.0)
        }
    }

    impl ClassifyError for Status {
        fn classify(&self) -> ErrorClass {
            match classify_status(self.0) {
                ErrorClass::RateLimited { .. } => ErrorClass::RateLimited {
                    retry_after: self.1.map(Duration::from_secs),
                },
                class => class,
            }
        }
    }

    /// An action that plays back `script`, then succeeds.
    fn scripted(
        script: Vec<Status>,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> std::future::Ready<Result<u32, Status>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let action = move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match script.get(call as usize) {
                Some(status) => Err(*status),
                None => Ok(call + 1),
            })
        };

        (calls, action)
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(RetryConfig::default(), CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let dispatcher = dispatcher();
        let (calls, action) = scripted(vec![Status(503, None); 3]);

        let start = Instant::now();
        let result = dispatcher.send(ActionKind::Send, action).await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        let stats = dispatcher.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_wait_for_the_hint_without_advancing_backoff() {
        let dispatcher = dispatcher();
        let (_, action) = scripted(vec![
            Status(500, None),
            Status(429, Some(45)),
            Status(502, None),
        ]);

        let start = Instant::now();
        dispatcher.send(ActionKind::Edit, action).await.unwrap();

        // 1s backoff, 45s hint over the 2s delay, then 2s: the 429 didn't double it
        assert_eq!(start.elapsed(), Duration::from_secs(48));
        assert_eq!(dispatcher.stats().rate_limited, 1);
        assert_eq!(dispatcher.stats().edited, 1);
    }

    #[test]
    fn serenity_errors_never_carry_a_hint() {
        assert_eq!(
            classify_status(429),
            ErrorClass::RateLimited { retry_after: None }
        );
        assert_eq!(classify_status(502), ErrorClass::Transient);
        assert_eq!(classify_status(404), ErrorClass::NonRetryable);

        let reset = serenity::Error::Io(std::io::Error::other("connection reset"));
        assert_eq!(reset.classify(), ErrorClass::Transient);
        assert!(!is_not_found(&reset));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_without_a_hint_wait_the_current_delay() {
        let dispatcher = dispatcher();
        let (_, action) = scripted(vec![Status(500, None), Status(429, None)]);

        let start = Instant::now();
        dispatcher.send(ActionKind::Send, action).await.unwrap();

        // 1s backoff, then the 429 waits the 2s current delay
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(dispatcher.stats().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_fail_immediately() {
        let dispatcher = dispatcher();
        let (calls, action) = scripted(vec![Status(403, None)]);

        let start = Instant::now();
        let result = dispatcher.send(ActionKind::Send, action).await;

        assert!(matches!(result, Err(DispatchError::Rejected(Status(403, _)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_makes_one_final_attempt_after_the_grace_period() {
        let dispatcher = dispatcher();
        let (calls, action) = scripted(vec![Status(500, None); 6]);

        let start = Instant::now();
        let result = dispatcher.send(ActionKind::Send, action).await;

        assert!(matches!(
            result,
            Err(DispatchError::Exhausted { attempts: 6, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // 1 + 2 + 4 + 8 + 16 of backoff, then the 10s grace
        assert_eq!(start.elapsed(), Duration::from_secs(41));

        let (calls, action) = scripted(vec![Status(500, None); 5]);
        assert_eq!(dispatcher.send(ActionKind::Send, action).await.unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_attempts() {
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::new(RetryConfig::default(), token.clone());
        let (calls, action) = scripted(vec![Status(500, None); 10]);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            token.cancel();
        });

        let result = dispatcher.send(ActionKind::Send, action).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(DispatchError::Cancelled)));
        // attempts at 0s, 1s and 3s would be three; cancelled during the 2s wait
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gated_sends_consult_the_ledger_first() {
        let tasks = TaskSupervisor::new();
        let ledger = Confined::spawn(
            "ledger",
            Ledger::new(RateLimitConfig {
                user_limit: 2,
                ..Default::default()
            }),
            &tasks,
        );
        let dispatcher = dispatcher().with_ledger(ledger);
        let origin = Origin {
            user: UserId::new(5),
            channel: ChannelId::new(6),
        };

        for _ in 0..2 {
            let (_, action) = scripted(vec![]);
            dispatcher
                .send_gated(origin, ActionKind::Send, action)
                .await
                .unwrap();
        }

        let (calls, action) = scripted(vec![]);
        let result = dispatcher.send_gated(origin, ActionKind::Send, action).await;

        let Err(DispatchError::Throttled(check)) = result else {
            panic!("expected a local throttle");
        };
        assert_eq!(check.retry_after, Duration::from_secs(300));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().throttled, 1);

        tasks.shutdown().await;
    }
}
