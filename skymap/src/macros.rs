/*
 * Created on Mon Jan 08 2024
 *
 * This file is a part of Skymap
 * Skymap is a free and open-source embedded key/value store that maps a
 * single file into memory and indexes records in a concurrent hash trie,
 * written by Sayan Nandan ("the Author") with the vision to provide
 * predictable sub-microsecond lookups on the hot path of high-throughput
 * network services.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

macro_rules! assertions {
    ($($assert:expr),*$(,)?) => {$(const _:()=::core::assert!($assert);)*}
}

/// Generate a constant group of bit flags with a `d()` decay method and a
/// `Debug` impl that prints the flag name
macro_rules! flags {
    ($(#[$attr:meta])* $vis:vis struct $group:ident: $ty:ty { $($(#[$cattr:meta])* $const:ident = $expr:expr),* $(,)?}) => (
        $(#[$attr])* $vis struct $group {r#const: $ty}
        #[allow(unused)]
        impl $group {
            $($(#[$cattr])* pub const $const: Self = Self { r#const: $expr };)*
            #[inline(always)] pub const fn d(&self) -> $ty { self.r#const }
            #[inline(always)] pub const fn bits() -> usize {
                let mut bits = 0; $(let _ = $expr; bits += 1;)* bits
            }
            pub const fn name(&self) -> &'static str {
                match self.r#const {$(capture if capture == $expr => ::core::stringify!($const),)* _ => ::core::unreachable!()}
            }
        }
        impl ::core::fmt::Debug for $group {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::write!(f, "{}::{}", ::core::stringify!($group), Self::name(self))
            }
        }
    );
}
