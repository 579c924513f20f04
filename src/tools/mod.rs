//! # Tools
//!
//! Function calling: declarations advertised to the backend, argument validation,
//! the batch dispatcher and the built-in tools.

pub mod diagnosis;
pub mod dispatcher;
pub mod market;
pub mod pending;
pub mod schema;
pub mod types;

pub use diagnosis::{CropDiagnosisTool, Diagnoser, KeywordDiagnoser};
pub use dispatcher::{ToolContext, ToolDispatcher, ToolHandler, ToolRegistry};
pub use market::{DateRange, MarketDataSource, MarketDataTool, MarketQuery, RecordTable, RegionalComparisonTool};
pub use pending::PendingRequests;
pub use schema::{validate_arguments, FunctionDeclaration, ParameterSchema, SchemaType};
pub use types::{CropDiseaseDiagnosis, GovernmentScheme, GovernmentSchemes, MandiRecord, MarketData, ToolResult};
