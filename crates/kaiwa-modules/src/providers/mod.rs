//! Built-in provider modules.
//!
//! All heavy inference is delegated to provider endpoints over HTTP; the only
//! fully in-process modules are the VAD probability estimator and the memory
//! blob cache.

pub mod asr;
pub mod llm;
pub mod memory;
pub mod tts;
pub mod vad;

pub use asr::HttpAsrFactory;
pub use llm::OpenAiChatFactory;
pub use memory::AgentMemoryFactory;
pub use tts::HttpTtsFactory;
pub use vad::PacketVadFactory;

use crate::registry::ModuleRegistry;
use crate::ModuleKind;

/// Register every built-in factory under its canonical codes. Provider codes
/// map to catalog entries; several codes can share one factory when they are
/// wire-compatible deployments of the same protocol.
pub fn register_builtin(registry: &mut ModuleRegistry) {
    for code in ["bailian", "zhipu", "openai", "azure_llm"] {
        registry.register_factory(ModuleKind::Llm, code, Box::new(OpenAiChatFactory));
    }
    for code in ["sensevoice", "azure_stt"] {
        registry.register_factory(ModuleKind::Asr, code, Box::new(HttpAsrFactory));
    }
    for code in ["bailian_tts", "azure_tts"] {
        registry.register_factory(ModuleKind::Tts, code, Box::new(HttpTtsFactory));
    }
    registry.register_factory(ModuleKind::Vad, "packet", Box::new(PacketVadFactory));
    registry.register_factory(ModuleKind::Memory, "agent_memory", Box::new(AgentMemoryFactory));
}
