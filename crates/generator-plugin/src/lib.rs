//! Generator plugin contract and loader for mq-loadgen.
//!
//! A generator plugin is user code exposing one capability:
//! [`MessageGenerator::generate_message`], invoked once per iteration with a
//! [`DataSink`] through which it emits payloads. The sink is the only broker
//! access plugins receive; they never see raw connection or session handles.
//!
//! Generators are resolved from a [`GeneratorSpec`]: either a builtin name
//! (see [`builtin`]) or a dynamic library compiled against this crate and
//! exporting an entry symbol via [`declare_generator!`].

pub mod builtin;
pub mod loader;

use async_trait::async_trait;
use broker_client::{Message, SendError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use loader::{LoadedGenerator, PluginLoader};

/// The producer capability exposed to plugin code.
#[async_trait]
pub trait DataSink: Send {
    /// Send a raw payload to the lane's destination.
    async fn send_data(&mut self, payload: &[u8]) -> Result<(), SendError>;

    /// Send a message with headers.
    async fn send(&mut self, message: Message) -> Result<(), SendError>;
}

/// Errors a generator invocation can surface.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// A send issued through the sink failed; classified by the engine.
    #[error(transparent)]
    Send(#[from] SendError),

    /// The generator failed this iteration but can be invoked again.
    #[error("generator error: {0}")]
    Recoverable(String),

    /// The generator cannot make progress; fails the lane.
    #[error("unrecoverable generator error: {0}")]
    Fatal(String),
}

/// A unit of user code that produces one message per invocation.
///
/// Instances are not assumed thread-safe: under the default per-lane sharing
/// policy each lane owns a fresh instance, so plugin authors can keep plain
/// mutable state.
#[async_trait]
pub trait MessageGenerator: Send {
    async fn generate_message(&mut self, producer: &mut dyn DataSink)
        -> Result<(), GeneratorError>;
}

/// Identity of the generator to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorSpec {
    /// A builtin generator, by registry name.
    Builtin { name: String },
    /// A dynamic library exporting a generator entry symbol.
    Dynamic {
        library: PathBuf,
        /// Entry symbol override; defaults to [`GENERATOR_ENTRY_SYMBOL`].
        symbol: Option<String>,
    },
}

impl std::fmt::Display for GeneratorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorSpec::Builtin { name } => write!(f, "builtin:{name}"),
            GeneratorSpec::Dynamic { library, .. } => {
                write!(f, "dynamic:{}", library.display())
            }
        }
    }
}

/// Whether each lane gets its own generator instance or all lanes share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharingPolicy {
    /// One fresh instance per lane (default); instance state needs no
    /// synchronization.
    #[default]
    PerLane,
    /// One instance shared by every lane behind a mutex.
    Shared,
}

/// A lane's handle to its generator under the configured sharing policy.
pub enum GeneratorHandle {
    Exclusive(Box<dyn MessageGenerator>),
    Shared(Arc<tokio::sync::Mutex<Box<dyn MessageGenerator>>>),
}

impl GeneratorHandle {
    pub async fn generate(&mut self, sink: &mut dyn DataSink) -> Result<(), GeneratorError> {
        match self {
            GeneratorHandle::Exclusive(generator) => generator.generate_message(sink).await,
            GeneratorHandle::Shared(shared) => {
                shared.lock().await.generate_message(sink).await
            }
        }
    }
}

/// Errors from resolving, validating, or instantiating a plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The loadable unit does not satisfy the generator contract: unknown
    /// builtin name, missing entry symbol, or API version mismatch.
    #[error("plugin contract violation: {reason}")]
    Contract { reason: String },

    /// The contract was satisfied but the constructor failed.
    #[error("plugin instantiation failed: {reason}")]
    Instantiation { reason: String },

    #[error("plugin library error: {0}")]
    Io(#[from] std::io::Error),
}

/// ABI version of the generator entry contract. Bump on breaking changes to
/// [`GeneratorEntry`] or the [`MessageGenerator`] trait.
pub const GENERATOR_API_VERSION: u32 = 1;

/// Default entry symbol exported by generator libraries.
pub const GENERATOR_ENTRY_SYMBOL: &str = "mq_loadgen_generator_entry";

/// Constructor exported by a generator library.
pub type GeneratorConstructor = fn() -> Result<Box<dyn MessageGenerator>, String>;

/// Entry table a generator library hands to the host.
#[repr(C)]
pub struct GeneratorEntry {
    pub api_version: u32,
    pub create: GeneratorConstructor,
}

/// Declare a generator entry point in a plugin library.
///
/// ```ignore
/// use generator_plugin::{declare_generator, MessageGenerator};
///
/// fn construct() -> Result<Box<dyn MessageGenerator>, String> {
///     Ok(Box::new(MyGenerator::default()))
/// }
///
/// declare_generator!(construct);
/// ```
#[macro_export]
macro_rules! declare_generator {
    ($constructor:path) => {
        #[no_mangle]
        pub extern "C" fn mq_loadgen_generator_entry() -> *const $crate::GeneratorEntry {
            static ENTRY: $crate::GeneratorEntry = $crate::GeneratorEntry {
                api_version: $crate::GENERATOR_API_VERSION,
                create: $constructor,
            };
            &ENTRY
        }
    };
}

#[cfg(test)]
pub(crate) mod test_sink {
    use super::*;

    /// Sink that records payloads, for exercising generators without a broker.
    #[derive(Default)]
    pub struct VecSink {
        pub payloads: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl DataSink for VecSink {
        async fn send_data(&mut self, payload: &[u8]) -> Result<(), SendError> {
            self.payloads.push(payload.to_vec());
            Ok(())
        }

        async fn send(&mut self, message: Message) -> Result<(), SendError> {
            self.payloads.push(message.payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_sink::VecSink;
    use super::*;

    struct CountingGenerator {
        count: u64,
    }

    #[async_trait]
    impl MessageGenerator for CountingGenerator {
        async fn generate_message(
            &mut self,
            producer: &mut dyn DataSink,
        ) -> Result<(), GeneratorError> {
            self.count += 1;
            producer.send_data(format!("n={}", self.count).as_bytes()).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exclusive_handle_owns_state() {
        let mut handle = GeneratorHandle::Exclusive(Box::new(CountingGenerator { count: 0 }));
        let mut sink = VecSink::default();
        handle.generate(&mut sink).await.unwrap();
        handle.generate(&mut sink).await.unwrap();
        assert_eq!(sink.payloads, vec![b"n=1".to_vec(), b"n=2".to_vec()]);
    }

    #[tokio::test]
    async fn test_shared_handle_serializes_access() {
        let shared: Arc<tokio::sync::Mutex<Box<dyn MessageGenerator>>> = Arc::new(
            tokio::sync::Mutex::new(Box::new(CountingGenerator { count: 0 })),
        );
        let mut a = GeneratorHandle::Shared(shared.clone());
        let mut b = GeneratorHandle::Shared(shared);
        let mut sink = VecSink::default();
        a.generate(&mut sink).await.unwrap();
        b.generate(&mut sink).await.unwrap();
        // Both handles advanced the same instance.
        assert_eq!(sink.payloads, vec![b"n=1".to_vec(), b"n=2".to_vec()]);
    }

    #[test]
    fn test_spec_display() {
        let spec = GeneratorSpec::Builtin {
            name: "hello-world".to_string(),
        };
        assert_eq!(spec.to_string(), "builtin:hello-world");
    }
}
