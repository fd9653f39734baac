use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use tracing::info;

use crate::{
    clients::{
        codec::{Codec, JsonCodec},
        debounce::PendingCall,
    },
    config::Config,
    error::{DispatchError, Result},
    models::{
        envelope::Envelope,
        listener::{DebounceConfig, ListenerContext, ListenerDescriptor},
        notification::Notification,
        retry::RetryPolicy,
    },
};

type BoxedHandler<N> =
    Arc<dyn Fn(N, ListenerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type KeyFn<N> = Arc<dyn Fn(&N) -> String + Send + Sync>;

struct DebounceSpec<N> {
    config: Option<DebounceConfig>,
    key: Option<KeyFn<N>>,
}

/// One handler declaration. Every name yields its own listener with its own
/// queues and workers.
pub struct ListenerSpec<N: Notification> {
    names: Vec<String>,
    handler: BoxedHandler<N>,
    concurrency: usize,
    retry_policy: Option<RetryPolicy>,
    debounce: Option<DebounceSpec<N>>,
}

impl<N: Notification> ListenerSpec<N> {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(N, ListenerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::named([name.into()], handler)
    }

    pub fn named<I, S, F, Fut>(names: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(N, ListenerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: BoxedHandler<N> = Arc::new(
            move |notification: N, context: ListenerContext| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler(notification, context))
            },
        );

        Self {
            names: names.into_iter().map(Into::into).collect(),
            handler,
            concurrency: 1,
            retry_policy: None,
            debounce: None,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Overrides both the type's and the global retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Debounce with the registry's default windows.
    pub fn debounced(mut self) -> Self {
        self.debounce.get_or_insert(DebounceSpec {
            config: None,
            key: None,
        });
        self
    }

    pub fn debounce(mut self, config: DebounceConfig) -> Self {
        self.debounce
            .get_or_insert(DebounceSpec {
                config: None,
                key: None,
            })
            .config = Some(config);
        self
    }

    /// Coalesce per key instead of per listener. Implies debouncing.
    pub fn debounce_key<K>(mut self, key: K) -> Self
    where
        K: Fn(&N) -> String + Send + Sync + 'static,
    {
        self.debounce
            .get_or_insert(DebounceSpec {
                config: None,
                key: None,
            })
            .key = Some(Arc::new(key));
        self
    }
}

/// A decoded delivery ready to run, plus the key to coalesce it under when
/// the listener is debounced.
pub struct PreparedCall {
    pub debounce_key: Option<String>,
    pub call: PendingCall,
}

trait Invoker: Send + Sync {
    fn prepare(&self, body: &[u8], context: ListenerContext) -> Result<PreparedCall>;
}

struct TypedInvoker<N, C> {
    codec: C,
    handler: BoxedHandler<N>,
    debounce_scope: Option<String>,
    debounce_key: Option<KeyFn<N>>,
}

impl<N: Notification, C: Codec> Invoker for TypedInvoker<N, C> {
    fn prepare(&self, body: &[u8], context: ListenerContext) -> Result<PreparedCall> {
        let notification: N = self.codec.decode(body)?;

        let debounce_key = self.debounce_scope.as_ref().map(|scope| {
            match &self.debounce_key {
                Some(key) => format!("{}:{}", scope, key(&notification)),
                None => scope.clone(),
            }
        });

        let handler = Arc::clone(&self.handler);
        let call: PendingCall = Box::new(move || handler(notification, context));

        Ok(PreparedCall { debounce_key, call })
    }
}

/// A listener with its policy resolved and its payload type erased.
#[derive(Clone)]
pub struct RegisteredListener {
    descriptor: ListenerDescriptor,
    invoker: Arc<dyn Invoker>,
}

impl RegisteredListener {
    pub fn descriptor(&self) -> &ListenerDescriptor {
        &self.descriptor
    }

    pub fn context(&self, envelope: &Envelope) -> ListenerContext {
        ListenerContext {
            notification_type: self.descriptor.notification_type.clone(),
            listener_name: self.descriptor.listener_name.clone(),
            concurrency: self.descriptor.concurrency,
            attempt: envelope.attempt,
            first_seen_ms: envelope.first_seen_ms,
            delay_ms: envelope.delay_ms,
        }
    }

    /// Decodes `body`; fails with `Serialization` when the payload is unreadable.
    pub fn prepare(&self, body: &[u8], context: ListenerContext) -> Result<PreparedCall> {
        self.invoker.prepare(body, context)
    }
}

pub struct ListenerRegistry<C: Codec = JsonCodec> {
    codec: C,
    default_retry: RetryPolicy,
    default_debounce: DebounceConfig,
    listeners: Vec<RegisteredListener>,
}

impl ListenerRegistry<JsonCodec> {
    pub fn new(config: &Config) -> Self {
        Self::with_codec(config, JsonCodec)
    }
}

impl<C: Codec> ListenerRegistry<C> {
    pub fn with_codec(config: &Config, codec: C) -> Self {
        Self {
            codec,
            default_retry: config.retry_policy(),
            default_debounce: config.debounce_config(),
            listeners: Vec::new(),
        }
    }

    /// Validates and adds every name of `spec`. Nothing is added when any
    /// name is invalid or already taken for the type.
    pub fn register<N: Notification>(&mut self, spec: ListenerSpec<N>) -> Result<&mut Self> {
        validate_type_name(N::TYPE_NAME)?;

        if spec.names.is_empty() {
            return Err(DispatchError::Registration(format!(
                "no listener name given for {}",
                N::TYPE_NAME
            )));
        }

        if spec.concurrency == 0 {
            return Err(DispatchError::Registration(format!(
                "concurrency for {} must be at least 1",
                N::TYPE_NAME
            )));
        }

        let retry_policy = spec
            .retry_policy
            .or(N::RETRY_POLICY)
            .unwrap_or(self.default_retry);
        retry_policy.validate()?;

        let debounce = match &spec.debounce {
            Some(debounce) => {
                let config = debounce.config.unwrap_or(self.default_debounce);
                config.validate()?;
                Some(config)
            }
            None => None,
        };

        for (i, name) in spec.names.iter().enumerate() {
            validate_listener_name(name)?;

            let taken = spec.names[..i].contains(name)
                || self.listeners.iter().any(|l| {
                    l.descriptor.notification_type == N::TYPE_NAME
                        && l.descriptor.listener_name == *name
                });

            if taken {
                return Err(DispatchError::Registration(format!(
                    "listener '{}' is already registered for {}",
                    name,
                    N::TYPE_NAME
                )));
            }
        }

        let debounce_key = spec.debounce.and_then(|d| d.key);

        for name in spec.names {
            let descriptor = ListenerDescriptor {
                notification_type: N::TYPE_NAME.to_string(),
                listener_name: name,
                concurrency: spec.concurrency,
                retry_policy,
                debounce,
            };

            let invoker = TypedInvoker {
                codec: self.codec.clone(),
                handler: Arc::clone(&spec.handler),
                debounce_scope: debounce.map(|_| {
                    format!("{}#{}", descriptor.notification_type, descriptor.listener_name)
                }),
                debounce_key: debounce_key.clone(),
            };

            info!(
                notification_type = %descriptor.notification_type,
                listener = %descriptor.listener_name,
                concurrency = descriptor.concurrency,
                max_attempts = descriptor.retry_policy.max_attempts,
                debounced = descriptor.debounce.is_some(),
                "Listener registered"
            );

            self.listeners.push(RegisteredListener {
                descriptor,
                invoker: Arc::new(invoker),
            });
        }

        Ok(self)
    }

    pub fn descriptors(&self) -> Vec<ListenerDescriptor> {
        self.listeners.iter().map(|l| l.descriptor.clone()).collect()
    }

    pub fn listeners(&self) -> &[RegisteredListener] {
        &self.listeners
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn into_listeners(self) -> Vec<RegisteredListener> {
        self.listeners
    }
}

fn validate_type_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('#') || name.chars().any(char::is_whitespace) {
        return Err(DispatchError::Registration(format!(
            "invalid notification type name '{}'",
            name
        )));
    }

    Ok(())
}

/// Listener names may not contain `.` (reserved for role markers) or `#`
/// (the type/listener separator).
fn validate_listener_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('.')
        || name.contains('#')
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(DispatchError::Registration(format!(
            "invalid listener name '{}'",
            name
        )));
    }

    Ok(())
}
