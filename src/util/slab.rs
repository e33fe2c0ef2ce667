/// A generational slab.
///
/// `insert` returns `(index, generation)`; lookups require both, so a handle
/// to a removed entry observes a dead slot even after the index has been
/// reused. Allocation and release are O(1) through an embedded free list.
#[derive(Debug)]
pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Slab<T> {
    pub(crate) fn new() -> Slab<T> {
        Slab {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> (u32, u32) {
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                debug_assert!(entry.value.is_none());
                entry.value = Some(value);
                (index, entry.generation)
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    value: Some(value),
                });
                (index, 0)
            }
        }
    }

    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.entries
            .get(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.entries
            .get_mut(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_mut())
    }

    /// Removes the entry, bumping the slot's generation so outstanding
    /// handles go stale.
    pub(crate) fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let entry = self.entries.get_mut(index as usize)?;
        if entry.generation != generation || entry.value.is_none() {
            return None;
        }
        entry.generation = entry.generation.wrapping_add(1);
        let value = entry.value.take();
        self.free.push(index);
        value
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = ((u32, u32), &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value
                .as_ref()
                .map(|v| ((i as u32, e.generation), v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Slab;

    #[test]
    fn insert_get_remove() {
        let mut slab = Slab::new();
        let (i, g) = slab.insert("a");
        assert_eq!(slab.get(i, g), Some(&"a"));
        assert_eq!(slab.remove(i, g), Some("a"));
        assert_eq!(slab.get(i, g), None);
        assert_eq!(slab.remove(i, g), None);
    }

    #[test]
    fn stale_generation_misses() {
        let mut slab = Slab::new();
        let (i1, g1) = slab.insert(1u32);
        slab.remove(i1, g1).unwrap();

        // The slot is reused with a new generation.
        let (i2, g2) = slab.insert(2u32);
        assert_eq!(i1, i2);
        assert_ne!(g1, g2);
        assert_eq!(slab.get(i1, g1), None);
        assert_eq!(slab.get(i2, g2), Some(&2));
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut slab = Slab::new();
        let (a, ga) = slab.insert("a");
        let (_, _) = slab.insert("b");
        slab.remove(a, ga).unwrap();
        let live: Vec<_> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec!["b"]);
    }
}
