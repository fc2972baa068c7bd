//! Identifier types and the first-free id pools used for clients and objects

use std::marker::PhantomData;

/// Client identifier, unique among currently connected peers
pub type ClientId = u8;

/// Object identifier, unique per table
pub type ObjectId = u16;

/// Client ids are drawn from `[0, CLIENT_CAPACITY)`; 255 is reserved as "nobody" on the wire
pub const CLIENT_CAPACITY: usize = 255;

/// Object ids are drawn from `[0, OBJECT_CAPACITY)`
pub const OBJECT_CAPACITY: usize = 65535;

/// Wire encoding of an absent client reference
pub const NO_CLIENT: u8 = 255;

/// Hands out the lowest unused id and takes ids back when they are freed
///
/// Allocation is a linear scan for the first hole, so a freed id is always
/// the next one handed out when it is the lowest free slot.
#[derive(Debug, Clone)]
pub struct IdPool<T> {
    used: Vec<bool>,
    in_use: usize,
    _id: PhantomData<T>,
}

impl<T> IdPool<T>
where
    T: Copy + Into<usize> + TryFrom<usize>,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            used: vec![false; capacity],
            in_use: 0,
            _id: PhantomData,
        }
    }

    /// Returns the first unused id, or None when the pool is exhausted
    pub fn allocate(&mut self) -> Option<T> {
        let index = self.used.iter().position(|used| !used)?;
        let id = T::try_from(index).ok()?;
        self.used[index] = true;
        self.in_use += 1;
        Some(id)
    }

    /// Marks a specific id as used. Returns false if it was out of range or already taken.
    pub fn reserve(&mut self, id: T) -> bool {
        match self.used.get_mut(id.into()) {
            Some(slot) if !*slot => {
                *slot = true;
                self.in_use += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns an id to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, id: T) -> bool {
        match self.used.get_mut(id.into()) {
            Some(slot) if *slot => {
                *slot = false;
                self.in_use -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_used(&self, id: T) -> bool {
        self.used.get(id.into()).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Frees every id
    pub fn clear(&mut self) {
        self.used.iter_mut().for_each(|slot| *slot = false);
        self.in_use = 0;
    }
}

/// Display colour for a client, derived only from its id
///
/// Hues are spaced by the golden angle so neighbouring ids stay distinguishable.
pub fn client_color(id: ClientId) -> (u8, u8, u8) {
    let hue = (f32::from(id) * 137.507_77) % 360.0;
    hsv_to_rgb(hue, 0.65, 0.95)
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> (u8, u8, u8) {
    let chroma = value * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = value - chroma;
    let channel = |c: f32| ((c + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    (channel(r), channel(g), channel(b))
}
