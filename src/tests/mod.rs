//! Cross-cutting scenario tests exercising more than one module at once
//! (config -> plan -> stats), as opposed to the narrower unit tests
//! that live alongside each module.

mod scenarios;
