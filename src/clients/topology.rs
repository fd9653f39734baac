//! Broker topology: deterministic naming plus idempotent declaration.
//!
//! For listener `L` of notification type `N` under prefix `P`:
//!
//! | entity | name | notes |
//! |---|---|---|
//! | live exchange | `P.N` | direct |
//! | delay exchange | `P.delay.N` | direct (ttl) or `x-delayed-message` (plugin) |
//! | delay queue | `P.delay.N` | ttl only, dead-letters to `P.N` |
//! | working queue | `P.N#L` | dead-letters to `P.retry.N#L` |
//! | retry queue | `P.retry.N#L` | dead-letters to `P.N` with key `P.N#L` |
//! | dead queue | `P.dead.N#L` | terminal |
//!
//! Working queues bind to the live exchange twice: under `P.N` (shared by all
//! listeners of the type, used by the publisher) and under `P.N#L` (private,
//! used when a retry expires).

use std::{collections::BTreeMap, sync::Arc};

use lapin::{
    Channel, ExchangeKind,
    options::{ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info};

use crate::{
    clients::rbmq::RabbitMqClient,
    config::{Config, DelayStrategy},
    error::{DispatchError, Result},
    models::listener::ListenerDescriptor,
};

const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
const DELAYED_TYPE: &str = "x-delayed-type";
const DELAYED_MESSAGE_KIND: &str = "x-delayed-message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    prefix: String,
}

/// Where a publish of one notification goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRoute {
    pub exchange: String,
    pub routing_key: String,
    /// Per-message TTL in milliseconds, set only for the ttl delay strategy.
    pub expiration_ms: Option<u64>,
}

impl TopologyNames {
    /// Role markers contain `.`, which listener names may not, so role-marked
    /// names never collide with working queues.
    pub const RETRY_MARK: &'static str = "retry.";
    pub const DEAD_MARK: &'static str = "dead.";
    pub const DELAY_MARK: &'static str = "delay.";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn live_exchange(&self, notification_type: &str) -> String {
        format!("{}{}", self.prefix, notification_type)
    }

    pub fn delay_exchange(&self, notification_type: &str) -> String {
        format!("{}{}{}", self.prefix, Self::DELAY_MARK, notification_type)
    }

    pub fn delay_queue(&self, notification_type: &str) -> String {
        self.delay_exchange(notification_type)
    }

    pub fn working_queue(&self, notification_type: &str, listener: &str) -> String {
        format!("{}{}#{}", self.prefix, notification_type, listener)
    }

    pub fn retry_queue(&self, notification_type: &str, listener: &str) -> String {
        format!(
            "{}{}{}#{}",
            self.prefix,
            Self::RETRY_MARK,
            notification_type,
            listener
        )
    }

    pub fn dead_queue(&self, notification_type: &str, listener: &str) -> String {
        format!(
            "{}{}{}#{}",
            self.prefix,
            Self::DEAD_MARK,
            notification_type,
            listener
        )
    }

    /// Routing key every listener queue of the type is bound with.
    pub fn broadcast_key(&self, notification_type: &str) -> String {
        self.live_exchange(notification_type)
    }

    /// Routing key only the listener's own working queue is bound with.
    pub fn listener_key(&self, notification_type: &str, listener: &str) -> String {
        self.working_queue(notification_type, listener)
    }

    pub fn publish_route(
        &self,
        notification_type: &str,
        strategy: DelayStrategy,
        delay_ms: Option<u64>,
    ) -> PublishRoute {
        match (delay_ms, strategy) {
            (Some(delay), DelayStrategy::Ttl) => PublishRoute {
                exchange: self.delay_exchange(notification_type),
                routing_key: self.delay_queue(notification_type),
                expiration_ms: Some(delay),
            },
            (Some(_), DelayStrategy::Plugin) => PublishRoute {
                exchange: self.delay_exchange(notification_type),
                routing_key: self.broadcast_key(notification_type),
                expiration_ms: None,
            },
            (None, _) => PublishRoute {
                exchange: self.live_exchange(notification_type),
                routing_key: self.broadcast_key(notification_type),
                expiration_ms: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    DelayedMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange {
        name: String,
        kind: ExchangeType,
        arguments: BTreeMap<String, String>,
    },
    Queue {
        name: String,
        arguments: BTreeMap<String, String>,
    },
    QueueBinding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    ExchangeBinding {
        destination: String,
        source: String,
        routing_key: String,
    },
}

impl Declaration {
    fn entity(&self) -> String {
        match self {
            Declaration::Exchange { name, .. } => format!("exchange {}", name),
            Declaration::Queue { name, .. } => format!("queue {}", name),
            Declaration::QueueBinding {
                queue,
                exchange,
                routing_key,
            } => format!("binding {} -> {} ({})", exchange, queue, routing_key),
            Declaration::ExchangeBinding {
                destination,
                source,
                routing_key,
            } => format!("binding {} -> {} ({})", source, destination, routing_key),
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            Declaration::Exchange { name, .. } | Declaration::Queue { name, .. } => Some(name),
            _ => None,
        }
    }

    fn same_kind(&self, other: &Declaration) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, Copy)]
enum Section {
    Exchanges,
    DeadQueues,
    RetryQueues,
    WorkingQueues,
    Delay,
    Bindings,
}

/// Ordered declarations. Order: exchanges, dead queues, retry queues, working
/// queues, delay entities, bindings, so anything published mid-provisioning
/// always has somewhere to land.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    exchanges: Vec<Declaration>,
    dead_queues: Vec<Declaration>,
    retry_queues: Vec<Declaration>,
    working_queues: Vec<Declaration>,
    delay: Vec<Declaration>,
    bindings: Vec<Declaration>,
}

impl TopologyPlan {
    pub fn for_listeners(
        names: &TopologyNames,
        strategy: DelayStrategy,
        listeners: &[ListenerDescriptor],
    ) -> Result<Self> {
        let mut plan = Self::default();

        for listener in listeners {
            plan.add_type(names, strategy, &listener.notification_type)?;
            plan.add_listener(names, &listener.notification_type, &listener.listener_name)?;
        }

        Ok(plan)
    }

    /// Type-level entities only: live exchange and delay path.
    pub fn for_type(
        names: &TopologyNames,
        strategy: DelayStrategy,
        notification_type: &str,
    ) -> Result<Self> {
        let mut plan = Self::default();
        plan.add_type(names, strategy, notification_type)?;

        Ok(plan)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.exchanges
            .iter()
            .chain(&self.dead_queues)
            .chain(&self.retry_queues)
            .chain(&self.working_queues)
            .chain(&self.delay)
            .chain(&self.bindings)
    }

    pub fn len(&self) -> usize {
        self.declarations().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn section_mut(&mut self, section: Section) -> &mut Vec<Declaration> {
        match section {
            Section::Exchanges => &mut self.exchanges,
            Section::DeadQueues => &mut self.dead_queues,
            Section::RetryQueues => &mut self.retry_queues,
            Section::WorkingQueues => &mut self.working_queues,
            Section::Delay => &mut self.delay,
            Section::Bindings => &mut self.bindings,
        }
    }

    /// Identical declarations collapse; the same exchange or queue name planned
    /// twice with different properties is a conflict.
    fn push(&mut self, section: Section, declaration: Declaration) -> Result<()> {
        if self.declarations().any(|d| *d == declaration) {
            return Ok(());
        }

        if let Some(name) = declaration.name() {
            if let Some(existing) = self
                .declarations()
                .find(|d| d.same_kind(&declaration) && d.name() == Some(name))
            {
                return Err(DispatchError::TopologyConflict {
                    entity: declaration.entity(),
                    reason: format!("already planned as {:?}", existing),
                });
            }
        }

        self.section_mut(section).push(declaration);
        Ok(())
    }

    fn add_type(
        &mut self,
        names: &TopologyNames,
        strategy: DelayStrategy,
        notification_type: &str,
    ) -> Result<()> {
        let live = names.live_exchange(notification_type);
        let delay_exchange = names.delay_exchange(notification_type);

        let exchange = Declaration::Exchange {
            name: live.clone(),
            kind: ExchangeType::Direct,
            arguments: BTreeMap::new(),
        };
        self.push(Section::Exchanges, exchange)?;

        match strategy {
            DelayStrategy::Ttl => {
                let delay_queue = names.delay_queue(notification_type);

                self.push(
                    Section::Delay,
                    Declaration::Queue {
                        name: delay_queue.clone(),
                        arguments: dead_letter_to(&live, &names.broadcast_key(notification_type)),
                    },
                )?;
                self.push(
                    Section::Delay,
                    Declaration::Exchange {
                        name: delay_exchange.clone(),
                        kind: ExchangeType::Direct,
                        arguments: BTreeMap::new(),
                    },
                )?;
                self.push(
                    Section::Bindings,
                    Declaration::QueueBinding {
                        queue: delay_queue.clone(),
                        exchange: delay_exchange,
                        routing_key: delay_queue,
                    },
                )?;
            }
            DelayStrategy::Plugin => {
                let arguments =
                    BTreeMap::from([(DELAYED_TYPE.to_string(), "direct".to_string())]);

                self.push(
                    Section::Delay,
                    Declaration::Exchange {
                        name: delay_exchange.clone(),
                        kind: ExchangeType::DelayedMessage,
                        arguments,
                    },
                )?;
                self.push(
                    Section::Bindings,
                    Declaration::ExchangeBinding {
                        destination: live,
                        source: delay_exchange,
                        routing_key: names.broadcast_key(notification_type),
                    },
                )?;
            }
        }

        Ok(())
    }

    fn add_listener(
        &mut self,
        names: &TopologyNames,
        notification_type: &str,
        listener: &str,
    ) -> Result<()> {
        let live = names.live_exchange(notification_type);
        let working = names.working_queue(notification_type, listener);
        let retry = names.retry_queue(notification_type, listener);
        let dead = names.dead_queue(notification_type, listener);

        self.push(
            Section::DeadQueues,
            Declaration::Queue {
                name: dead,
                arguments: BTreeMap::new(),
            },
        )?;
        self.push(
            Section::RetryQueues,
            Declaration::Queue {
                name: retry.clone(),
                arguments: dead_letter_to(&live, &names.listener_key(notification_type, listener)),
            },
        )?;
        self.push(
            Section::WorkingQueues,
            Declaration::Queue {
                name: working.clone(),
                arguments: dead_letter_to("", &retry),
            },
        )?;

        for routing_key in [
            names.broadcast_key(notification_type),
            names.listener_key(notification_type, listener),
        ] {
            self.push(
                Section::Bindings,
                Declaration::QueueBinding {
                    queue: working.clone(),
                    exchange: live.clone(),
                    routing_key,
                },
            )?;
        }

        Ok(())
    }
}

fn dead_letter_to(exchange: &str, routing_key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (DEAD_LETTER_EXCHANGE.to_string(), exchange.to_string()),
        (DEAD_LETTER_ROUTING_KEY.to_string(), routing_key.to_string()),
    ])
}

fn field_table(arguments: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }
    table
}

pub struct TopologyManager {
    client: Arc<RabbitMqClient>,
    names: TopologyNames,
    strategy: DelayStrategy,
}

impl TopologyManager {
    pub fn new(client: Arc<RabbitMqClient>, config: &Config) -> Self {
        Self {
            client,
            names: TopologyNames::new(config.broker_name_prefix.clone()),
            strategy: config.broker_delay_strategy,
        }
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    pub fn strategy(&self) -> DelayStrategy {
        self.strategy
    }

    pub fn plan(&self, listeners: &[ListenerDescriptor]) -> Result<TopologyPlan> {
        TopologyPlan::for_listeners(&self.names, self.strategy, listeners)
    }

    /// Declares every entity the listeners need. Safe to repeat; a clash with
    /// an existing entity surfaces as `TopologyConflict`.
    pub async fn ensure_topology(&self, listeners: &[ListenerDescriptor]) -> Result<()> {
        let plan = self.plan(listeners)?;
        self.apply(&plan).await?;

        info!(
            listeners = listeners.len(),
            declarations = plan.len(),
            "Topology ensured"
        );

        Ok(())
    }

    pub async fn ensure_type(&self, notification_type: &str) -> Result<()> {
        let plan = TopologyPlan::for_type(&self.names, self.strategy, notification_type)?;
        self.apply(&plan).await
    }

    async fn apply(&self, plan: &TopologyPlan) -> Result<()> {
        let channel = self.client.channel().await?;

        for declaration in plan.declarations() {
            declare(&channel, declaration)
                .await
                .map_err(|e| DispatchError::from_declare(&declaration.entity(), e))?;

            debug!(entity = %declaration.entity(), "Declared");
        }

        if let Err(e) = channel.close(200, "topology declared".into()).await {
            debug!(error = %e, "Topology channel close failed");
        }

        Ok(())
    }
}

async fn declare(channel: &Channel, declaration: &Declaration) -> lapin::Result<()> {
    match declaration {
        Declaration::Exchange {
            name,
            kind,
            arguments,
        } => {
            let kind = match kind {
                ExchangeType::Direct => ExchangeKind::Direct,
                ExchangeType::DelayedMessage => ExchangeKind::Custom(DELAYED_MESSAGE_KIND.into()),
            };

            channel
                .exchange_declare(
                    name.as_str().into(),
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    field_table(arguments),
                )
                .await
        }
        Declaration::Queue { name, arguments } => channel
            .queue_declare(
                name.as_str().into(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                field_table(arguments),
            )
            .await
            .map(|_| ()),
        Declaration::QueueBinding {
            queue,
            exchange,
            routing_key,
        } => {
            channel
                .queue_bind(
                    queue.as_str().into(),
                    exchange.as_str().into(),
                    routing_key.as_str().into(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
        }
        Declaration::ExchangeBinding {
            destination,
            source,
            routing_key,
        } => {
            channel
                .exchange_bind(
                    destination.as_str().into(),
                    source.as_str().into(),
                    routing_key.as_str().into(),
                    ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await
        }
    }
}
