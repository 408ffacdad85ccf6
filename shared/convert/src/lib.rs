mod converter;
mod mapping;
mod placeholder;

pub use converter::{StateConversionError, StateConverter, StateDict, StateValue};
pub use mapping::{KeyTemplates, StateMapping, StateMappingTemplate, UnflattenDim};
pub use placeholder::{PlaceholderBounds, PlaceholderValues, TemplatePlaceholder};
