pub mod unique_ordered_map;

pub use unique_ordered_map::{DuplicateKeyError, UniqueOrderedMap};

#[macro_export]
macro_rules! map {
	($($key:expr => $val:expr),* $(,)?) => {
		std::iter::Iterator::collect([
			$({
				($key, $val)
			},)*
		].into_iter())
	};
}

/// Builds a UniqueOrderedMap from literal entries, panicking on duplicate
/// keys. Intended for tests and other contexts where the keys are
/// statically known to be distinct.
#[macro_export]
macro_rules! unique_ordered_map {
	($($key:expr => $val:expr),* $(,)?) => {{
		#[allow(unused_mut)]
		let mut out = $crate::util::UniqueOrderedMap::new();
		$(out.insert($key, $val)
			.expect("duplicate key in unique_ordered_map! literal");)*
		out
	}};
}
