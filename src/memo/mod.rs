//! Memoization key derivation.
//!
//! A call's memo URI is its cache key and its storage namespace at
//! once. It composes the storage root, the fixed runner prefix, the
//! pipeline id, the function identity (with optional logic key), the
//! logic keys of any functions the callee is declared to call, and the
//! hash of the canonicalized arguments.

mod calls;
mod function_id;
mod key;
mod memospace;

pub use calls::calls_segments;
pub use calls::Callee;
pub use function_id::extract_logic_key;
pub use function_id::function_segment;
pub use function_id::parse_function_segment;
pub use function_id::FunctionId;
pub use key::argument_hash;
pub use memospace::make_function_memospace;
pub use memospace::make_memo_uri;
pub use memospace::parse_memo_uri;
pub use memospace::MemoComponents;
pub use memospace::MemospaceHandler;
