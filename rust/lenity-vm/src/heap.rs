//! Heap storage: unification cells, mutable objects and the transaction
//! journal.
//!
//! Every mutation of reachable state goes through a `set_*` primitive that
//! records an undo entry in the current transaction. Transactions are not a
//! stack: a speculative region can stay open after its parent moved on, so
//! the caller selects the current one and names the transaction a commit
//! merges into. Aborting replays a transaction's entries backwards.

use crate::cell::{Cells, SavedCell};
use crate::ids::*;
use crate::suspension::Suspension;
use crate::values::{shallow_eq, Shallow, Value};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct HeapArray {
    pub items: Vec<Value>,
    /// Set by `InPlaceMakeImmutable`; frozen arrays reject mutation.
    pub frozen: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HeapObject {
    pub fields: Vec<(Rc<str>, Value)>,
}

#[derive(Debug, Clone, Default)]
pub struct Semaphore {
    pub count: i64,
    pub awaiter: Option<TaskId>,
}

/// Result of comparing two values that may contain placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Equal,
    Unequal,
    /// Equal so far, but this placeholder decides the rest.
    Unknown(Value),
}

/// Result of looking a key up in a map.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(usize),
    Missing,
    Blocked(Value),
}

#[derive(Debug)]
enum Undo {
    Var { id: VarId, old: Value },
    ArraySet { id: ArrayId, index: usize, old: Value },
    ArrayPush { id: ArrayId },
    MapInsert { id: MapId },
    MapReplace { id: MapId, index: usize, old: Value },
    Field { id: ObjectId, index: usize, old: Value },
}

#[derive(Debug)]
struct TxFrame {
    id: TxId,
    undo: Vec<Undo>,
}

#[derive(Default)]
pub struct Heap {
    pub(crate) cells: Cells,
    vars: Vec<Value>,
    arrays: Vec<HeapArray>,
    maps: Vec<Vec<(Value, Value)>>,
    objects: Vec<HeapObject>,
    semaphores: Vec<Semaphore>,
    open: Vec<TxFrame>,
    current: Option<TxId>,
    next_tx: u32,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Placeholders ----

    pub fn new_placeholder(&mut self) -> Value {
        Value::Placeholder(self.cells.alloc())
    }

    /// Chases `value` through resolved placeholders. Returns either a concrete
    /// value or the root placeholder of an unresolved class.
    pub fn follow(&mut self, value: &Value) -> Value {
        match value {
            Value::Placeholder(id) => match self.cells.resolved(*id) {
                Some(v) => v,
                None => Value::Placeholder(self.cells.find(*id)),
            },
            other => other.clone(),
        }
    }

    pub fn is_concrete(&mut self, value: &Value) -> bool {
        !self.follow(value).is_placeholder()
    }

    /// Unifies `target` with `value`: two placeholders are merged, a
    /// placeholder meeting a concrete value is resolved (its waiters are
    /// appended to `fired`), and concrete values are compared structurally.
    /// Returns `false` on a conflict.
    pub fn def(&mut self, target: &Value, value: &Value, fired: &mut VecDeque<Suspension>) -> bool {
        let mut work = vec![(target.clone(), value.clone())];
        while let Some((left, right)) = work.pop() {
            let left = self.follow(&left);
            let right = self.follow(&right);
            match (&left, &right) {
                (Value::Placeholder(a), Value::Placeholder(b)) => self.cells.unify(*a, *b),
                (Value::Placeholder(a), _) => fired.extend(self.cells.resolve(*a, right)),
                (_, Value::Placeholder(b)) => fired.extend(self.cells.resolve(*b, left)),
                _ => match shallow_eq(&left, &right) {
                    Shallow::Equal => {}
                    Shallow::Unequal => return false,
                    Shallow::Nested(pairs) => work.extend(pairs.into_iter().rev()),
                },
            }
        }
        true
    }

    /// Structural comparison that never resolves anything.
    pub fn compare(&mut self, left: &Value, right: &Value) -> Comparison {
        let mut work = vec![(left.clone(), right.clone())];
        let mut unknown = None;
        while let Some((l, r)) = work.pop() {
            let l = self.follow(&l);
            let r = self.follow(&r);
            if let (Value::Placeholder(a), Value::Placeholder(b)) = (&l, &r) {
                if a == b {
                    continue;
                }
            }
            if l.is_placeholder() || r.is_placeholder() {
                if unknown.is_none() {
                    unknown = Some(if l.is_placeholder() { l } else { r });
                }
                continue;
            }
            match shallow_eq(&l, &r) {
                Shallow::Equal => {}
                Shallow::Unequal => return Comparison::Unequal,
                Shallow::Nested(pairs) => work.extend(pairs.into_iter().rev()),
            }
        }
        match unknown {
            Some(p) => Comparison::Unknown(p),
            None => Comparison::Equal,
        }
    }

    /// First unresolved placeholder anywhere inside `value`.
    pub fn first_placeholder(&mut self, value: &Value) -> Option<Value> {
        let mut work = vec![value.clone()];
        while let Some(v) = work.pop() {
            match self.follow(&v) {
                p @ Value::Placeholder(_) => return Some(p),
                Value::Option(inner) => work.push((*inner).clone()),
                Value::Array(items) => work.extend(items.iter().rev().cloned()),
                Value::Map(entries) => {
                    for (k, v) in entries.iter().rev() {
                        work.push(v.clone());
                        work.push(k.clone());
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Queues `suspension` on `cell`, or onto `ready` if the cell has
    /// already resolved.
    pub fn enqueue(&mut self, cell: &Value, suspension: Suspension, ready: &mut VecDeque<Suspension>) {
        let handed_back = match cell {
            Value::Placeholder(id) => self.cells.enqueue(*id, suspension),
            _ => Some(suspension),
        };
        if let Some(s) = handed_back {
            ready.push_back(s);
        }
    }

    /// Saves the cell behind `value`, if it is a placeholder.
    pub(crate) fn save_cell(&mut self, value: &Value) -> Option<SavedCell> {
        match value {
            Value::Placeholder(id) => Some(self.cells.save(*id)),
            _ => None,
        }
    }

    pub(crate) fn restore_cell(&mut self, saved: SavedCell) {
        self.cells.restore(saved);
    }

    pub fn waiter_count(&mut self, cell: &Value) -> usize {
        match cell {
            Value::Placeholder(id) => self.cells.waiter_count(*id),
            _ => 0,
        }
    }

    pub fn placeholder_count(&self) -> usize {
        self.cells.len()
    }

    // ---- Vars ----

    pub fn new_var(&mut self, initial: Value) -> VarId {
        self.vars.push(initial);
        VarId::from_index(self.vars.len() - 1)
    }

    pub fn var(&self, id: VarId) -> Option<&Value> {
        self.vars.get(id.index())
    }

    pub fn set_var(&mut self, id: VarId, value: Value) {
        if let Some(slot) = self.vars.get_mut(id.index()) {
            let old = std::mem::replace(slot, value);
            self.record(Undo::Var { id, old });
        }
    }

    // ---- Mutable arrays ----

    pub fn new_array(&mut self, items: Vec<Value>) -> ArrayId {
        self.arrays.push(HeapArray {
            items,
            frozen: false,
        });
        ArrayId::from_index(self.arrays.len() - 1)
    }

    pub fn array(&self, id: ArrayId) -> Option<&HeapArray> {
        self.arrays.get(id.index())
    }

    /// `false` if `index` is out of bounds.
    pub fn set_array_item(&mut self, id: ArrayId, index: usize, value: Value) -> bool {
        let Some(slot) = self
            .arrays
            .get_mut(id.index())
            .and_then(|a| a.items.get_mut(index))
        else {
            return false;
        };
        let old = std::mem::replace(slot, value);
        self.record(Undo::ArraySet { id, index, old });
        true
    }

    pub fn push_array_item(&mut self, id: ArrayId, value: Value) {
        if let Some(array) = self.arrays.get_mut(id.index()) {
            array.items.push(value);
            self.record(Undo::ArrayPush { id });
        }
    }

    pub fn freeze_array(&mut self, id: ArrayId) {
        if let Some(array) = self.arrays.get_mut(id.index()) {
            array.frozen = true;
        }
    }

    // ---- Mutable maps ----

    pub fn new_map(&mut self, entries: Vec<(Value, Value)>) -> MapId {
        self.maps.push(entries);
        MapId::from_index(self.maps.len() - 1)
    }

    pub fn map(&self, id: MapId) -> Option<&[(Value, Value)]> {
        self.maps.get(id.index()).map(|m| m.as_slice())
    }

    /// Position of `key` among `entries`' keys.
    pub fn lookup(&mut self, entries: &[(Value, Value)], key: &Value) -> Lookup {
        let mut blocked = None;
        for (i, (k, _)) in entries.iter().enumerate() {
            match self.compare(k, key) {
                Comparison::Equal => return Lookup::Found(i),
                Comparison::Unequal => {}
                Comparison::Unknown(p) => {
                    blocked.get_or_insert(p);
                }
            }
        }
        match blocked {
            Some(p) => Lookup::Blocked(p),
            None => Lookup::Missing,
        }
    }

    /// Inserts or replaces `key`. Blocks instead if a placeholder decides
    /// whether the key is already present.
    pub fn set_map_entry(&mut self, id: MapId, key: Value, value: Value) -> Lookup {
        let entries = match self.maps.get(id.index()) {
            Some(m) => m.clone(),
            None => return Lookup::Missing,
        };
        match self.lookup(&entries, &key) {
            Lookup::Found(index) => {
                let old = std::mem::replace(&mut self.maps[id.index()][index].1, value);
                self.record(Undo::MapReplace { id, index, old });
                Lookup::Found(index)
            }
            Lookup::Missing => {
                self.maps[id.index()].push((key, value));
                self.record(Undo::MapInsert { id });
                Lookup::Found(entries.len())
            }
            blocked @ Lookup::Blocked(_) => blocked,
        }
    }

    // ---- Objects ----

    pub fn new_object(&mut self, fields: Vec<(Rc<str>, Value)>) -> ObjectId {
        self.objects.push(HeapObject { fields });
        ObjectId::from_index(self.objects.len() - 1)
    }

    pub fn field_index(&self, id: ObjectId, name: &str) -> Option<usize> {
        self.objects
            .get(id.index())?
            .fields
            .iter()
            .position(|(n, _)| &**n == name)
    }

    /// Current field value, materializing a placeholder in an empty field.
    pub fn field(&mut self, id: ObjectId, index: usize) -> Option<Value> {
        let current = self.objects.get(id.index())?.fields.get(index)?.1.clone();
        if !current.is_uninitialized() {
            return Some(current);
        }
        let placeholder = self.new_placeholder();
        self.objects[id.index()].fields[index].1 = placeholder.clone();
        Some(placeholder)
    }

    /// Raw field slot, without materializing.
    pub fn raw_field(&self, id: ObjectId, index: usize) -> Option<&Value> {
        Some(&self.objects.get(id.index())?.fields.get(index)?.1)
    }

    /// Fills an empty field without journaling; unification state is not
    /// an effect.
    pub fn init_field(&mut self, id: ObjectId, index: usize, value: Value) {
        if let Some(field) = self
            .objects
            .get_mut(id.index())
            .and_then(|o| o.fields.get_mut(index))
        {
            field.1 = value;
        }
    }

    pub fn set_field(&mut self, id: ObjectId, index: usize, value: Value) {
        if let Some(field) = self
            .objects
            .get_mut(id.index())
            .and_then(|o| o.fields.get_mut(index))
        {
            let old = std::mem::replace(&mut field.1, value);
            self.record(Undo::Field { id, index, old });
        }
    }

    // ---- Semaphores ----

    pub fn new_semaphore(&mut self) -> SemaphoreId {
        self.semaphores.push(Semaphore::default());
        SemaphoreId::from_index(self.semaphores.len() - 1)
    }

    pub fn semaphore(&self, id: SemaphoreId) -> Option<&Semaphore> {
        self.semaphores.get(id.index())
    }

    pub fn semaphore_mut(&mut self, id: SemaphoreId) -> Option<&mut Semaphore> {
        self.semaphores.get_mut(id.index())
    }

    // ---- Melt / freeze ----

    /// Deep copy with arrays and maps made mutable. Mutable containers
    /// inside `value` are shared, not copied.
    pub fn melt(&mut self, value: &Value) -> Result<Value, CopyError> {
        self.copy(value, CopyMode::Melt)
    }

    /// Deep immutable copy of mutable arrays and maps. A mutable container
    /// that reaches itself cannot be frozen.
    pub fn freeze(&mut self, value: &Value) -> Result<Value, CopyError> {
        self.copy(value, CopyMode::Freeze)
    }

    fn copy(&mut self, value: &Value, mode: CopyMode) -> Result<Value, CopyError> {
        let mut work = vec![CopyStep::Visit(value.clone())];
        let mut built: Vec<Value> = Vec::new();
        let mut path = HashSet::new();
        while let Some(step) = work.pop() {
            match step {
                CopyStep::Visit(v) => match self.follow(&v) {
                    p @ Value::Placeholder(_) => return Err(CopyError::Blocked(p)),
                    Value::Option(inner) => {
                        work.push(CopyStep::Option);
                        work.push(CopyStep::Visit((*inner).clone()));
                    }
                    Value::Array(items) => {
                        work.push(CopyStep::Array(items.len()));
                        work.extend(items.iter().rev().cloned().map(CopyStep::Visit));
                    }
                    Value::Map(entries) => {
                        work.push(CopyStep::Map(entries.len()));
                        push_entries(&mut work, &entries);
                    }
                    Value::MutableArray(id) if mode == CopyMode::Freeze => {
                        let container = Container::Array(id);
                        if !path.insert(container) {
                            return Err(CopyError::Cyclic);
                        }
                        let items = self.arrays.get(id.index()).map(|a| a.items.clone()).unwrap_or_default();
                        work.push(CopyStep::Leave(container));
                        work.push(CopyStep::Array(items.len()));
                        work.extend(items.into_iter().rev().map(CopyStep::Visit));
                    }
                    Value::MutableMap(id) if mode == CopyMode::Freeze => {
                        let container = Container::Map(id);
                        if !path.insert(container) {
                            return Err(CopyError::Cyclic);
                        }
                        let entries = self.maps.get(id.index()).cloned().unwrap_or_default();
                        work.push(CopyStep::Leave(container));
                        work.push(CopyStep::Map(entries.len()));
                        push_entries(&mut work, &entries);
                    }
                    other => built.push(other),
                },
                CopyStep::Option => {
                    let inner = built.pop().unwrap_or(Value::Uninitialized);
                    built.push(Value::Option(Rc::new(inner)));
                }
                CopyStep::Array(len) => {
                    let items = built.split_off(built.len().saturating_sub(len));
                    built.push(match mode {
                        CopyMode::Melt => Value::MutableArray(self.new_array(items)),
                        CopyMode::Freeze => Value::array(items),
                    });
                }
                CopyStep::Map(len) => {
                    let mut flat = built.split_off(built.len().saturating_sub(2 * len)).into_iter();
                    let mut entries = Vec::with_capacity(len);
                    while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
                        entries.push((k, v));
                    }
                    built.push(match mode {
                        CopyMode::Melt => Value::MutableMap(self.new_map(entries)),
                        CopyMode::Freeze => Value::Map(Rc::new(entries)),
                    });
                }
                CopyStep::Leave(container) => {
                    path.remove(&container);
                }
            }
        }
        Ok(built.pop().unwrap_or(Value::Uninitialized))
    }

    // ---- Transactions ----

    /// Opens a transaction and makes it the one writes are journaled in.
    pub fn tx_start(&mut self) -> TxId {
        let id = TxId::from_index(self.next_tx as usize);
        self.next_tx += 1;
        self.open.push(TxFrame {
            id,
            undo: Vec::new(),
        });
        self.current = Some(id);
        id
    }

    /// Selects the transaction subsequent writes are journaled in. `None`,
    /// or a transaction that is no longer open, makes writes final.
    pub fn set_current(&mut self, id: Option<TxId>) {
        self.current = id;
    }

    pub fn current(&self) -> Option<TxId> {
        self.current
    }

    /// Closes `id`, keeping its writes. Its undo entries move to `into` when
    /// that is still open, so an abort there rolls them back too; otherwise
    /// they are dropped. `false` if `id` is not open.
    pub fn tx_commit(&mut self, id: TxId, into: Option<TxId>) -> bool {
        let Some(pos) = self.open.iter().position(|f| f.id == id) else {
            return false;
        };
        let frame = self.open.remove(pos);
        if let Some(target) = into.and_then(|into| self.open.iter_mut().find(|f| f.id == into)) {
            target.undo.extend(frame.undo);
        }
        if self.current == Some(id) {
            self.current = into;
        }
        true
    }

    /// Rolls back the writes journaled in `id`, newest first. Other open
    /// transactions are untouched. `false` if `id` is not open.
    pub fn tx_abort(&mut self, id: TxId) -> bool {
        let Some(pos) = self.open.iter().position(|f| f.id == id) else {
            return false;
        };
        let frame = self.open.remove(pos);
        for undo in frame.undo.into_iter().rev() {
            self.apply(undo);
        }
        if self.current == Some(id) {
            self.current = None;
        }
        true
    }

    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    fn record(&mut self, undo: Undo) {
        let Some(current) = self.current else { return };
        if let Some(frame) = self.open.iter_mut().rev().find(|f| f.id == current) {
            frame.undo.push(undo);
        }
    }

    fn apply(&mut self, undo: Undo) {
        match undo {
            Undo::Var { id, old } => self.vars[id.index()] = old,
            Undo::ArraySet { id, index, old } => self.arrays[id.index()].items[index] = old,
            Undo::ArrayPush { id } => {
                self.arrays[id.index()].items.pop();
            }
            Undo::MapInsert { id } => {
                self.maps[id.index()].pop();
            }
            Undo::MapReplace { id, index, old } => self.maps[id.index()][index].1 = old,
            Undo::Field { id, index, old } => self.objects[id.index()].fields[index].1 = old,
        }
    }

    // ---- Rendering ----

    /// Human-readable rendering, following placeholders. A container met
    /// again inside itself renders as `...`.
    pub fn render(&mut self, value: &Value) -> String {
        let mut out = String::new();
        let mut work = vec![RenderStep::Visit(value.clone())];
        let mut path = HashSet::new();
        while let Some(step) = work.pop() {
            let value = match step {
                RenderStep::Text(text) => {
                    out.push_str(&text);
                    continue;
                }
                RenderStep::Leave(container) => {
                    path.remove(&container);
                    continue;
                }
                RenderStep::Visit(v) => self.follow(&v),
            };
            let (prefix, container, parts) = match value {
                Value::Option(inner) if !matches!(*inner, Value::False) => {
                    ("option", None, vec![vec![RenderStep::Visit((*inner).clone())]])
                }
                Value::Array(items) => ("array", None, item_parts(&items)),
                Value::MutableArray(id) => {
                    let items = self.arrays.get(id.index()).map(|a| a.items.clone()).unwrap_or_default();
                    ("array", Some(Container::Array(id)), item_parts(&items))
                }
                Value::Map(entries) => ("map", None, entry_parts(&entries)),
                Value::MutableMap(id) => {
                    let entries = self.maps.get(id.index()).cloned().unwrap_or_default();
                    ("map", Some(Container::Map(id)), entry_parts(&entries))
                }
                Value::Var(id) => {
                    let inner = self.vars.get(id.index()).cloned().unwrap_or(Value::Uninitialized);
                    ("var", Some(Container::Var(id)), vec![vec![RenderStep::Visit(inner)]])
                }
                Value::Object(id) => {
                    let fields = self.objects.get(id.index()).map(|o| o.fields.clone()).unwrap_or_default();
                    let parts = fields
                        .into_iter()
                        .map(|(n, v)| vec![RenderStep::Text(format!("{} := ", n)), RenderStep::Visit(v)])
                        .collect();
                    ("object", Some(Container::Object(id)), parts)
                }
                scalar => {
                    out.push_str(&render_scalar(&scalar));
                    continue;
                }
            };
            if let Some(container) = container {
                if !path.insert(container) {
                    out.push_str("...");
                    continue;
                }
                work.push(RenderStep::Leave(container));
            }
            out.push_str(prefix);
            out.push('{');
            work.push(RenderStep::Text("}".to_string()));
            for (i, part) in parts.into_iter().enumerate().rev() {
                work.extend(part.into_iter().rev());
                if i > 0 {
                    work.push(RenderStep::Text(", ".to_string()));
                }
            }
        }
        out
    }
}

/// Why `melt` or `freeze` produced no copy.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyError {
    /// This placeholder must resolve first.
    Blocked(Value),
    /// A mutable container reaches itself.
    Cyclic,
}

#[derive(Clone, Copy, PartialEq)]
enum CopyMode {
    Melt,
    Freeze,
}

/// Heap containers that can be reached again while walking a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Container {
    Array(ArrayId),
    Map(MapId),
    Var(VarId),
    Object(ObjectId),
}

enum CopyStep {
    Visit(Value),
    Option,
    Array(usize),
    Map(usize),
    Leave(Container),
}

enum RenderStep {
    Visit(Value),
    Text(String),
    Leave(Container),
}

fn push_entries(work: &mut Vec<CopyStep>, entries: &[(Value, Value)]) {
    for (k, v) in entries.iter().rev() {
        work.push(CopyStep::Visit(v.clone()));
        work.push(CopyStep::Visit(k.clone()));
    }
}

fn item_parts(items: &[Value]) -> Vec<Vec<RenderStep>> {
    items.iter().map(|v| vec![RenderStep::Visit(v.clone())]).collect()
}

fn entry_parts(entries: &[(Value, Value)]) -> Vec<Vec<RenderStep>> {
    entries
        .iter()
        .map(|(k, v)| {
            vec![
                RenderStep::Visit(k.clone()),
                RenderStep::Text(" => ".to_string()),
                RenderStep::Visit(v.clone()),
            ]
        })
        .collect()
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Uninitialized | Value::Placeholder(_) => "_".to_string(),
        Value::EffectDone => "done".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => format!("{}", f),
        Value::Rational(r) => format!("{}/{}", r.numerator(), r.denominator()),
        Value::String(s) => s.to_string(),
        Value::False => "false".to_string(),
        Value::Option(_) => "true".to_string(),
        Value::Function(id) => format!("function#{}", id.0),
        Value::Native(n) => format!("native:{}", n.name),
        Value::Type(tag) => tag.to_string(),
        Value::Task(id) => format!("task#{}", id.0),
        Value::Semaphore(id) => format!("semaphore#{}", id.0),
        Value::Array(_) | Value::MutableArray(_) | Value::Map(_) | Value::MutableMap(_) => String::new(),
        Value::Var(_) | Value::Object(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn def_resolves_nested_placeholders() {
        let mut heap = Heap::new();
        let mut fired = VecDeque::new();
        let p = heap.new_placeholder();
        let pattern = Value::array(vec![p.clone(), Value::int(2)]);
        let concrete = Value::array(vec![Value::int(1), Value::int(2)]);
        assert!(heap.def(&pattern, &concrete, &mut fired));
        assert_eq!(heap.follow(&p), Value::int(1));
    }

    #[test]
    fn def_conflict_fails() {
        let mut heap = Heap::new();
        let mut fired = VecDeque::new();
        let p = heap.new_placeholder();
        assert!(heap.def(&p, &Value::int(1), &mut fired));
        assert!(heap.def(&p, &Value::int(1), &mut fired));
        assert!(!heap.def(&p, &Value::int(2), &mut fired));
    }

    #[test]
    fn def_unifies_two_placeholders() {
        let mut heap = Heap::new();
        let mut fired = VecDeque::new();
        let a = heap.new_placeholder();
        let b = heap.new_placeholder();
        assert!(heap.def(&a, &b, &mut fired));
        assert!(heap.def(&b, &Value::string("x"), &mut fired));
        assert_eq!(heap.follow(&a).as_str(), Some("x"));
    }

    #[test]
    fn compare_reports_deciding_placeholder() {
        let mut heap = Heap::new();
        let p = heap.new_placeholder();
        let a = Value::array(vec![Value::int(1), p.clone()]);
        let b = Value::array(vec![Value::int(1), Value::int(2)]);
        assert_eq!(heap.compare(&a, &b), Comparison::Unknown(p));
        let c = Value::array(vec![Value::int(9), Value::int(2)]);
        assert_eq!(heap.compare(&a, &c), Comparison::Unequal);
    }

    #[test]
    fn abort_rolls_back_merged_writes() {
        let mut heap = Heap::new();
        let v = heap.new_var(Value::int(0));
        let arr = heap.new_array(vec![Value::int(1)]);

        let outer = heap.tx_start();
        heap.set_var(v, Value::int(1));
        let inner = heap.tx_start();
        heap.push_array_item(arr, Value::int(2));
        heap.set_var(v, Value::int(2));
        assert!(heap.tx_commit(inner, Some(outer)));
        assert_eq!(heap.current(), Some(outer));
        assert!(heap.tx_abort(outer));

        assert_eq!(heap.var(v), Some(&Value::int(0)));
        assert_eq!(heap.array(arr).map(|a| a.items.len()), Some(1));
        assert_eq!(heap.open_transactions(), 0);
    }

    #[test]
    fn committed_writes_survive_inner_abort() {
        let mut heap = Heap::new();
        let v = heap.new_var(Value::int(0));
        let w = heap.new_var(Value::int(0));
        let outer = heap.tx_start();
        heap.set_var(v, Value::int(1));
        let inner = heap.tx_start();
        heap.set_var(w, Value::int(1));
        assert!(heap.tx_abort(inner));
        assert!(heap.tx_commit(outer, None));
        assert_eq!(heap.var(v), Some(&Value::int(1)));
        assert_eq!(heap.var(w), Some(&Value::int(0)));
        assert!(!heap.tx_commit(outer, None));
    }

    #[test]
    fn transactions_settle_independently() {
        let mut heap = Heap::new();
        let v = heap.new_var(Value::int(0));
        let w = heap.new_var(Value::int(0));
        let first = heap.tx_start();
        heap.set_var(v, Value::int(7));
        let second = heap.tx_start();
        heap.set_var(w, Value::int(8));

        assert!(heap.tx_commit(second, None));
        assert_eq!(heap.open_transactions(), 1);
        assert!(heap.tx_abort(first));
        assert_eq!(heap.var(v), Some(&Value::int(0)));
        assert_eq!(heap.var(w), Some(&Value::int(8)));
    }

    #[test]
    fn writes_go_to_the_selected_transaction() {
        let mut heap = Heap::new();
        let v = heap.new_var(Value::int(0));
        let w = heap.new_var(Value::int(0));
        let first = heap.tx_start();
        let second = heap.tx_start();
        heap.set_current(Some(first));
        heap.set_var(v, Value::int(1));
        heap.set_current(Some(second));
        heap.set_var(w, Value::int(1));

        assert!(heap.tx_abort(first));
        assert_eq!(heap.var(v), Some(&Value::int(0)));
        assert_eq!(heap.var(w), Some(&Value::int(1)));
    }

    #[test]
    fn map_entries_replace_and_roll_back() {
        let mut heap = Heap::new();
        let m = heap.new_map(vec![(Value::string("a"), Value::int(1))]);
        let tx = heap.tx_start();
        assert_eq!(heap.set_map_entry(m, Value::string("a"), Value::int(5)), Lookup::Found(0));
        assert_eq!(heap.set_map_entry(m, Value::string("b"), Value::int(6)), Lookup::Found(1));
        heap.tx_abort(tx);
        let entries = heap.map(m).map(|e| e.to_vec()).unwrap_or_default();
        assert_eq!(entries, vec![(Value::string("a"), Value::int(1))]);
    }

    #[test]
    fn melt_then_freeze_round_trips_shape() {
        let mut heap = Heap::new();
        let nested = Value::array(vec![Value::array(vec![Value::int(1)]), Value::int(2)]);
        let melted = heap.melt(&nested).unwrap();
        assert!(matches!(melted, Value::MutableArray(_)));
        let frozen = heap.freeze(&melted).unwrap();
        assert_eq!(frozen, nested);
        assert_eq!(heap.render(&frozen), "array{array{1}, 2}");
    }

    #[test]
    fn melt_blocks_on_placeholder() {
        let mut heap = Heap::new();
        let p = heap.new_placeholder();
        let v = Value::array(vec![Value::int(1), p.clone()]);
        assert_eq!(heap.melt(&v), Err(CopyError::Blocked(p)));
    }

    #[test]
    fn freeze_rejects_self_containing_array() {
        let mut heap = Heap::new();
        let a = heap.new_array(Vec::new());
        heap.push_array_item(a, Value::MutableArray(a));
        assert_eq!(heap.freeze(&Value::MutableArray(a)), Err(CopyError::Cyclic));
        assert_eq!(heap.render(&Value::MutableArray(a)), "array{...}");
    }

    #[test]
    fn shared_containers_are_not_cycles() {
        let mut heap = Heap::new();
        let inner = heap.new_array(vec![Value::int(1)]);
        let outer = heap.new_array(vec![Value::MutableArray(inner), Value::MutableArray(inner)]);
        let frozen = heap.freeze(&Value::MutableArray(outer)).unwrap();
        assert_eq!(heap.render(&frozen), "array{array{1}, array{1}}");
        let m = heap.new_map(Vec::new());
        heap.set_map_entry(m, Value::string("k"), Value::MutableMap(m));
        assert_eq!(heap.render(&Value::MutableMap(m)), "map{k => ...}");
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let mut heap = Heap::new();
        let mut value = Value::int(0);
        for _ in 0..100_000 {
            value = Value::array(vec![value]);
        }
        let melted = heap.melt(&value).unwrap();
        let frozen = heap.freeze(&melted).unwrap();
        assert!(matches!(frozen, Value::Array(_)));
        assert!(heap.render(&frozen).ends_with("0}}}"));
        // Dropping a deeply nested Rc chain recurses; unwind it by hand.
        let mut rest = Some(frozen);
        while let Some(Value::Array(items)) = rest.take() {
            rest = Rc::try_unwrap(items).ok().and_then(|mut v| v.pop());
        }
        let mut rest = Some(value);
        while let Some(Value::Array(items)) = rest.take() {
            rest = Rc::try_unwrap(items).ok().and_then(|mut v| v.pop());
        }
    }
}
