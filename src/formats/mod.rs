//! Binary format parsers

pub mod macho;
