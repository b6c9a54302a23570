use std::iter::FilterMap;
use std::ops::{Index, IndexMut};
use std::marker::PhantomData;
use std::slice::Iter;

pub trait Key {
    fn id(self) -> usize;

    fn key(id: usize) -> Self;
}

#[derive(Clone, Debug)]
pub struct VecMap<K, V> where K: Key {
    _marker: PhantomData<K>,
    vec: Vec<Option<V>>,
}

impl<K, V> VecMap<K, V> where K: Key {
    pub fn new() -> Self {
        VecMap::<K, V> {
            _marker: PhantomData,
            vec: Vec::new(),
        }
    }

    pub fn with_capacity(size: u8) -> Self {
        VecMap::<K, V> {
            _marker: PhantomData,
            vec: Vec::with_capacity(size as usize),
        }
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    pub fn push(&mut self, value: V) -> K {
        self.vec.push(Some(value));
        K::key(self.vec.len() - 1)
    }

    pub fn get(&self, index: K) -> Option<&V> {
        match self.vec.get(index.id()) {
            Some(opt) => opt.as_ref(),
            None => None
        }
    }

    pub fn get_mut(&mut self, index: K) -> Option<&mut V> {
        match self.vec.get_mut(index.id()) {
            Some(opt) => opt.as_mut(),
            None => None
        }
    }

    pub fn set(&mut self, index: K, value: V) {
        let id = index.id();
        if id >= self.vec.len() {
            self.vec.resize_with(id + 1, || {None})
        }
        self.vec[id] = Some(value);
    }

    /// Occupied entries, with their keys.
    pub fn entries(&self) -> impl Iterator<Item=(K, &V)> + '_ {
        self.vec
            .iter()
            .enumerate()
            .filter_map(|(id, opt)| opt.as_ref().map(|v| (K::key(id), v)))
    }
}

impl<K, V> Default for VecMap<K, V> where K: Key {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Key for T where T: From<u8> + Into<u8> {
    fn id(self) -> usize {
        self.into() as usize
    }

    fn key(id: usize) -> T {
        T::from(id.try_into().unwrap())
    }
}

impl<K, V> Index<K> for VecMap<K, V>
where K: Key
{
    type Output = V;

    fn index(&self, index: K) -> &V {
        self.vec[index.id()].as_ref().unwrap()
    }
}

impl<K, V> IndexMut<K> for VecMap<K, V>
where K: Key
{
    fn index_mut(&mut self, index: K) -> &mut V {
        self.vec[index.id()].as_mut().unwrap()
    }
}

#[allow(clippy::type_complexity)]
impl<'v, K, V> IntoIterator for &'v VecMap<K, V> where K: Key {
    type Item = &'v V;
    type IntoIter =
        FilterMap<Iter<'v, Option<V>>, fn(&Option<V>) -> Option<&V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.vec.iter().filter_map(Option::<V>::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::InterfaceNum;

    #[test]
    fn test_sparse_keys() {
        let mut map = VecMap::<InterfaceNum, &str>::new();
        map.set(InterfaceNum(2), "two");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(InterfaceNum(0)), None);
        assert_eq!(map[InterfaceNum(2)], "two");
        assert_eq!(map.push("three"), InterfaceNum(3));
        let keys: Vec<InterfaceNum> = map.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![InterfaceNum(2), InterfaceNum(3)]);
        assert_eq!(map.into_iter().count(), 2);
    }
}
