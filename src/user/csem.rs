// Counting semaphore built from two binary semaphores
//
// `s1` guards the count; `s2` is down exactly while the count is exhausted.
// The count lives in user memory so every thread of the process shares it.
use crate::user::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingSemaphore {
    s1: i32,
    s2: i32,
    value: u64,
}

impl CountingSemaphore {
    /// Create a semaphore with `initial` permits. `None` if `initial` is
    /// negative or the binary semaphore pool is exhausted.
    pub fn new(u: &User<'_>, initial: i32) -> Option<Self> {
        if initial < 0 {
            return None;
        }
        let s1 = u.bsem_alloc();
        if s1 < 0 {
            return None;
        }
        let s2 = u.bsem_alloc();
        if s2 < 0 {
            u.bsem_free(s1);
            return None;
        }
        let value = u.malloc(4);
        u.write_i32(value, initial);
        if initial == 0 {
            u.bsem_down(s2);
        }
        Some(Self { s1, s2, value })
    }

    pub fn down(&self, u: &User<'_>) {
        u.bsem_down(self.s2);
        u.bsem_down(self.s1);
        let v = u.read_i32(self.value) - 1;
        u.write_i32(self.value, v);
        if v > 0 {
            u.bsem_up(self.s2);
        }
        u.bsem_up(self.s1);
    }

    pub fn up(&self, u: &User<'_>) {
        u.bsem_down(self.s1);
        let v = u.read_i32(self.value) + 1;
        u.write_i32(self.value, v);
        if v == 1 {
            u.bsem_up(self.s2);
        }
        u.bsem_up(self.s1);
    }

    pub fn value(&self, u: &User<'_>) -> i32 {
        u.read_i32(self.value)
    }

    pub fn free(self, u: &User<'_>) {
        u.bsem_free(self.s1);
        u.bsem_free(self.s2);
    }
}
