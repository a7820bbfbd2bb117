//! The capabilities behind the built-in tool servers.
//!
//! Each module wraps exactly one external capability as a
//! [`mcp::ToolService`]:
//!
//! - [`weather`]: `query_weather` over the OpenWeather API
//! - [`sql`]: `query_database`, read-only SQL on a SQLite file
//! - [`ppt`]: `translate_ppt`, text translation inside `.pptx` files

mod error;
pub mod ppt;
pub mod sql;
pub mod weather;

pub use error::{CapabilityError, Result};
pub use ppt::{OpenAiTranslator, PptServer, Translator, TranslatorConfig};
pub use sql::SqlServer;
pub use weather::{CurrentConditions, OpenWeather, WeatherConfig, WeatherServer, WeatherSource};
