pub mod api;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod utils;

pub use clients::{
    codec::{Codec, JsonCodec},
    debounce::DebounceCoordinator,
    publisher::Publisher,
    registry::{ListenerRegistry, ListenerSpec},
    topology::{TopologyManager, TopologyNames},
};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{DispatchError, Result};
pub use models::{
    listener::{DebounceConfig, ListenerContext},
    notification::Notification,
    retry::RetryPolicy,
};
