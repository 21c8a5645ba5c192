pub mod catalog;
pub mod metrics;
pub mod module;
pub mod providers;
pub mod registry;

pub use catalog::{ModuleCatalog, ServiceEntry};
pub use metrics::{MetricRow, MetricsRecorder, MetricsSink, MonitorScope, PricingTable};
pub use module::{ChunkSender, ChunkStream, Module, ModuleFactory, ModuleKind, StreamChunk, ToolSpec};
pub use registry::ModuleRegistry;
