/// An object-safe version of `Extend`.
pub(crate) trait ExtendOne<Item> {
    fn extend_one(&mut self, item: Item);
    fn extend_iter(&mut self, iter: &mut dyn Iterator<Item = Item>) {
        for item in iter {
            self.extend_one(item);
        }
    }
}

impl<Item, T: Extend<Item> + ?Sized> ExtendOne<Item> for T {
    fn extend_one(&mut self, item: Item) {
        Extend::extend(self, core::iter::once(item))
    }

    fn extend_iter(&mut self, iter: &mut dyn Iterator<Item = Item>) {
        Extend::extend(self, iter)
    }
}

/// Round `value` up to the next multiple of `align`, which need not be a power of two.
pub(crate) fn align_npot(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

/// Round `value` down to a multiple of `align`.
pub(crate) fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    value - value % align
}
