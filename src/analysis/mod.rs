//! Analysis Layer
//!
//! Turns detections and recognized text into priced items.

pub mod association;
pub mod price;

pub use association::{AssociationConfig, PriceAssociation, PriceAssociator, ReferencePoint};
pub use price::{extract_prices, PriceToken};
