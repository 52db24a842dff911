use crate::error::{LispError, LispResult};
use crate::value::{FrameId, PairId, Value};

/// A single cons cell on the heap.
pub struct ConsCell {
    pub car: Value,
    pub cdr: Value,
}

/// An environment frame: the argument slots of one function activation.
///
/// Frames are allocated at their final size. A frame created by `DUM` starts
/// out unfilled and is populated in place by `RAP`, which is what lets
/// `letrec` closures capture a frame that ends up containing themselves.
pub struct Frame {
    slots: Vec<Value>,
    filled: bool,
}

/// The cons cell and frame arenas. `PairId` indexes `cells`, `FrameId`
/// indexes `frames`. Nothing is ever freed: the arenas live as long as the
/// world that owns them.
pub struct Heap {
    cells: Vec<ConsCell>,
    frames: Vec<Frame>,
    capacity: usize,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        Heap {
            cells: Vec::with_capacity(1024),
            frames: Vec::with_capacity(256),
            capacity,
        }
    }

    fn check_capacity(&self) -> LispResult<()> {
        if self.cells.len() + self.frames.len() >= self.capacity {
            return Err(LispError::HeapOverflow);
        }
        Ok(())
    }

    /// Allocate a new cons cell. Returns a PairId.
    /// Returns Err(HeapOverflow) if capacity is exceeded.
    pub fn alloc(&mut self, car: Value, cdr: Value) -> LispResult<PairId> {
        self.check_capacity()?;
        let id = PairId(self.cells.len() as u32);
        self.cells.push(ConsCell { car, cdr });
        Ok(id)
    }

    /// Allocate a pair and wrap it as a value.
    pub fn cons(&mut self, car: Value, cdr: Value) -> LispResult<Value> {
        Ok(Value::Pair(self.alloc(car, cdr)?))
    }

    /// Get the car of a pair.
    #[inline]
    pub fn car(&self, id: PairId) -> Value {
        self.cells[id.0 as usize].car
    }

    /// Get the cdr of a pair.
    #[inline]
    pub fn cdr(&self, id: PairId) -> Value {
        self.cells[id.0 as usize].cdr
    }

    /// Set the car of a pair (rplaca).
    #[inline]
    pub fn set_car(&mut self, id: PairId, val: Value) {
        self.cells[id.0 as usize].car = val;
    }

    /// Set the cdr of a pair (rplacd).
    #[inline]
    pub fn set_cdr(&mut self, id: PairId, val: Value) {
        self.cells[id.0 as usize].cdr = val;
    }

    /// Get car of a Value if it's a pair, or Nil if it's Nil.
    pub fn car_val(&self, val: Value) -> LispResult<Value> {
        match val {
            Value::Nil => Ok(Value::Nil),
            Value::Pair(id) => Ok(self.car(id)),
            _ => Err(LispError::type_error(format!("car of non-list {}", val.type_name()))),
        }
    }

    /// Get cdr of a Value if it's a pair, or Nil if it's Nil.
    pub fn cdr_val(&self, val: Value) -> LispResult<Value> {
        match val {
            Value::Nil => Ok(Value::Nil),
            Value::Pair(id) => Ok(self.cdr(id)),
            _ => Err(LispError::type_error(format!("cdr of non-list {}", val.type_name()))),
        }
    }

    /// (car (cdr x))
    pub fn cadr(&self, val: Value) -> LispResult<Value> {
        let rest = self.cdr_val(val)?;
        self.car_val(rest)
    }

    /// Build a proper list from a slice of values.
    pub fn list(&mut self, values: &[Value]) -> LispResult<Value> {
        self.list_with_tail(values, Value::Nil)
    }

    /// Build a list of `values` ending in `tail` instead of nil.
    pub fn list_with_tail(&mut self, values: &[Value], tail: Value) -> LispResult<Value> {
        let mut result = tail;
        for &val in values.iter().rev() {
            result = self.cons(val, result)?;
        }
        Ok(result)
    }

    /// Returns true if this value is a proper list.
    pub fn is_proper_list(&self, val: Value) -> bool {
        let mut current = val;
        loop {
            match current {
                Value::Nil => return true,
                Value::Pair(id) => current = self.cdr(id),
                _ => return false,
            }
        }
    }

    /// Collect a proper list into a Vec. Returns None if not a proper list.
    pub fn list_to_vec(&self, val: Value) -> Option<Vec<Value>> {
        let mut result = Vec::new();
        let mut current = val;
        loop {
            match current {
                Value::Nil => return Some(result),
                Value::Pair(id) => {
                    result.push(self.car(id));
                    current = self.cdr(id);
                }
                _ => return None,
            }
        }
    }

    /// Length of a proper list, None for dotted lists and atoms.
    pub fn list_len(&self, val: Value) -> Option<usize> {
        let mut len = 0;
        let mut current = val;
        loop {
            match current {
                Value::Nil => return Some(len),
                Value::Pair(id) => {
                    len += 1;
                    current = self.cdr(id);
                }
                _ => return None,
            }
        }
    }

    /// Structural equality: pairs are compared element by element, atoms by
    /// identity.
    pub fn equal(&self, a: Value, b: Value) -> bool {
        let mut a = a;
        let mut b = b;
        loop {
            match (a, b) {
                (Value::Pair(x), Value::Pair(y)) => {
                    if x == y {
                        return true;
                    }
                    if !self.equal(self.car(x), self.car(y)) {
                        return false;
                    }
                    a = self.cdr(x);
                    b = self.cdr(y);
                }
                _ => return a == b,
            }
        }
    }

    // === Frames ===

    /// Allocate a filled frame holding `slots`.
    pub fn alloc_frame(&mut self, slots: Vec<Value>) -> LispResult<FrameId> {
        self.check_capacity()?;
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(Frame {
            slots,
            filled: true,
        });
        Ok(id)
    }

    /// Allocate an unfilled frame of `size` slots, to be filled later.
    pub fn alloc_dummy_frame(&mut self, size: usize) -> LispResult<FrameId> {
        self.check_capacity()?;
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(Frame {
            slots: vec![Value::Nil; size],
            filled: false,
        });
        Ok(id)
    }

    /// Populate a frame created by `alloc_dummy_frame`.
    pub fn fill_frame(&mut self, id: FrameId, values: Vec<Value>) -> LispResult<()> {
        let frame = &mut self.frames[id.0 as usize];
        if frame.filled {
            return Err(LispError::fatal("recursive apply on a frame that is already filled"));
        }
        if frame.slots.len() != values.len() {
            return Err(LispError::fatal(format!(
                "recursive apply with {} values for a {}-slot frame",
                values.len(),
                frame.slots.len()
            )));
        }
        frame.slots = values;
        frame.filled = true;
        Ok(())
    }

    fn filled_frame(&self, id: FrameId) -> LispResult<&Frame> {
        let frame = &self.frames[id.0 as usize];
        if !frame.filled {
            return Err(LispError::UnboundVariable(
                "letrec binding referenced before initialization".into(),
            ));
        }
        Ok(frame)
    }

    /// Read slot `slot` of a frame.
    pub fn frame_slot(&self, id: FrameId, slot: usize) -> LispResult<Value> {
        let frame = self.filled_frame(id)?;
        frame
            .slots
            .get(slot)
            .copied()
            .ok_or_else(|| LispError::fatal(format!("frame slot {} out of range", slot)))
    }

    /// Write slot `slot` of a frame.
    pub fn set_frame_slot(&mut self, id: FrameId, slot: usize, val: Value) -> LispResult<()> {
        self.filled_frame(id)?;
        match self.frames[id.0 as usize].slots.get_mut(slot) {
            Some(cell) => {
                *cell = val;
                Ok(())
            }
            None => Err(LispError::fatal(format!("frame slot {} out of range", slot))),
        }
    }

    /// The `&rest` view of a frame: a fresh list of every slot from `slot`
    /// onward.
    pub fn frame_rest(&mut self, id: FrameId, slot: usize) -> LispResult<Value> {
        let frame = self.filled_frame(id)?;
        let tail: Vec<Value> = frame.slots.get(slot..).unwrap_or(&[]).to_vec();
        self.list(&tail)
    }

    /// Assign a `&rest` variable: the slots from `slot` onward are replaced
    /// by the elements of `list`.
    pub fn set_frame_rest(&mut self, id: FrameId, slot: usize, list: Value) -> LispResult<()> {
        let items = self
            .list_to_vec(list)
            .ok_or_else(|| LispError::type_error("a &rest variable can only hold a proper list"))?;
        self.filled_frame(id)?;
        let frame = &mut self.frames[id.0 as usize];
        frame.slots.truncate(slot);
        frame.slots.extend(items);
        Ok(())
    }

    /// Number of slots in a frame.
    pub fn frame_len(&self, id: FrameId) -> usize {
        self.frames[id.0 as usize].slots.len()
    }

    /// Returns the number of allocated cells.
    pub fn total_cells(&self) -> usize {
        self.cells.len()
    }

    /// Returns the number of allocated frames.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_roundtrip_and_length() {
        let mut heap = Heap::new(1000);
        let list = heap.list(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(heap.list_len(list), Some(3));
        assert_eq!(
            heap.list_to_vec(list).unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        let dotted = heap.cons(Value::Int(1), Value::Int(2)).unwrap();
        assert!(!heap.is_proper_list(dotted));
        assert_eq!(heap.list_len(dotted), None);
    }

    #[test]
    fn equal_is_structural_eq_is_identity() {
        let mut heap = Heap::new(1000);
        let a = heap.list(&[Value::Int(1), Value::True]).unwrap();
        let b = heap.list(&[Value::Int(1), Value::True]).unwrap();
        assert!(heap.equal(a, b));
        assert!(!a.eq(b));
        assert!(a.eq(a));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut heap = Heap::new(2);
        heap.alloc(Value::Nil, Value::Nil).unwrap();
        heap.alloc(Value::Nil, Value::Nil).unwrap();
        assert!(matches!(heap.alloc(Value::Nil, Value::Nil), Err(LispError::HeapOverflow)));
    }

    #[test]
    fn dummy_frame_is_filled_in_place() {
        let mut heap = Heap::new(1000);
        let id = heap.alloc_dummy_frame(2).unwrap();
        assert!(heap.frame_slot(id, 0).is_err());
        heap.fill_frame(id, vec![Value::Int(7), Value::Int(8)]).unwrap();
        assert_eq!(heap.frame_slot(id, 1).unwrap(), Value::Int(8));
        assert!(heap.fill_frame(id, vec![Value::Nil, Value::Nil]).unwrap_err().is_fatal());
    }

    #[test]
    fn rest_slots_read_and_write_as_lists() {
        let mut heap = Heap::new(1000);
        let id = heap
            .alloc_frame(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        let rest = heap.frame_rest(id, 1).unwrap();
        assert_eq!(heap.list_to_vec(rest).unwrap(), vec![Value::Int(2), Value::Int(3)]);

        let replacement = heap.list(&[Value::Int(9)]).unwrap();
        heap.set_frame_rest(id, 1, replacement).unwrap();
        assert_eq!(heap.frame_len(id), 2);
        let rest = heap.frame_rest(id, 1).unwrap();
        assert_eq!(heap.list_to_vec(rest).unwrap(), vec![Value::Int(9)]);
    }
}
