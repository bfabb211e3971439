// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;

use crate::{CachePolicy, PhysicalAddress};

/// A memory object that backs a mapping with pages.
///
/// The region tree never looks at the pages themselves. It only needs to know how large the object
/// is, whether it insists on a particular cache policy, and how to obtain the physical page behind a
/// faulting offset.
pub trait VmObject: fmt::Debug + Send + Sync {
    /// The size of the object in bytes.
    fn size(&self) -> u64;

    /// The cache policy mappings of this object must use, or `None` if the object has no opinion.
    fn mapping_cache_policy(&self) -> Option<CachePolicy>;

    /// Returns the physical page backing the page-aligned `offset`, allocating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`][crate::Error::NoMemory] if the page cannot be provided.
    fn commit_page(&self, offset: u64, will_write: bool) -> crate::Result<PhysicalAddress>;

    /// For the privileged system image, the byte range of the object that may be mapped executable.
    ///
    /// An address space permits exactly one executable mapping of such an object, and only of
    /// exactly this range.
    fn system_image_code_range(&self) -> Option<Range<u64>> {
        None
    }
}
