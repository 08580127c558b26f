/// Distributed object handles, undo history and wire images.
pub mod object;
/// Worker-wide cache of object handles.
pub mod object_cache;
/// Read-lock registry.
pub mod read_map;
