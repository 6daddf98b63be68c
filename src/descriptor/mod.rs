pub mod model;
pub mod parser;

pub use model::{EndpointDescriptor, Security, TransportType};
pub use parser::{ParseError, ParsedBatch, parse, parse_batch};
