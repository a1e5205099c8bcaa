/*!
 * Memory subsystem tests entry point
 */

#[path = "memory/layout_test.rs"]
mod layout_test;

#[path = "memory/space_test.rs"]
mod space_test;
