// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use super::tree::Inner;
use crate::address_range::AddressRangeExt;
use crate::node::{Node, NodeRef};
use crate::{Error, Mmu};

impl<M: Mmu> Inner<M> {
    pub(super) fn dump(
        &self,
        node: NodeRef,
        depth: usize,
        out: &mut impl fmt::Write,
    ) -> crate::Result<()> {
        self.alive(node)?;
        self.dump_node(node, depth, out)
            .map_err(|_| Error::Internal("dump writer failed"))
    }

    fn dump_node(&self, node: NodeRef, depth: usize, out: &mut impl fmt::Write) -> fmt::Result {
        let n = self.get(node);
        write_line(n, depth, out)?;

        if let Some(region) = n.as_region() {
            for child in region.children.values() {
                self.dump_node(*child, depth + 1, out)?;
            }
        }

        Ok(())
    }
}

fn write_line(n: &Node, depth: usize, out: &mut impl fmt::Write) -> fmt::Result {
    let last = n.range.end.sub(1);
    write!(
        out,
        "{:indent$}{} [{} {}] sz {:#x}",
        "",
        n.kind(),
        n.range.start,
        last,
        n.range.len(),
        indent = depth * 2
    )?;

    if let Some(mapping) = n.as_mapping() {
        write!(
            out,
            " mmu {} offset {:#x}",
            mapping.mmu_flags, mapping.object_offset
        )?;
    } else {
        write!(out, " flags {}", n.flags)?;
    }

    writeln!(out, " '{}'", n.name)
}
