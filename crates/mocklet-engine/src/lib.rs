//! Configuration-driven HTTP mock engine.
//!
//! Requests flow through a route table, a resource matcher, a step-based
//! behavior resolver, and a response sender chain; a dispatch loop ties the
//! stages together and applies status-keyed error handlers. Transport
//! integration happens through [`transport::TransportAdapter`] so the engine
//! stays framework-agnostic.

pub mod behavior;
pub mod cache;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod matcher;
pub mod router;
pub mod scripting;
pub mod sender;
pub mod transport;

pub use behavior::{BehaviorType, ResponseBehavior, ResponseResolver, StepConfig};
pub use config::{EngineConfig, ExecutionMode, FailureType, PerformanceSimulation, ResponseConfig};
pub use dispatch::{Dispatcher, ErrorHandler};
pub use error::EngineError;
pub use exchange::{Exchange, ExchangePhase, HttpRequest, HttpResponse};
pub use matcher::{MatchOutcome, ResourceMatcher, ResourceRule};
pub use router::{Route, RouteHandler, RouteTable};
pub use scripting::{ScriptEngine, ScriptEngineRegistry, ScriptSource};
pub use sender::{ResponseSender, SendPipeline};
