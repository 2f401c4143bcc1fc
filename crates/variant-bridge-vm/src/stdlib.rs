//! The small standard library available to sessions.

use bitflags::bitflags;

use crate::error::VmError;
use crate::state::{MULTRET, Thread};
use crate::value::{Value, VmType, format_number};

bitflags! {
    /// Libraries loaded by [`Thread::open_libs`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LibraryFlags: u32 {
        const BASE = 1 << 0;
        const TABLE = 1 << 1;
        const STRING = 1 << 2;
        const ALL = Self::BASE.bits() | Self::TABLE.bits() | Self::STRING.bits();
    }
}

impl Default for LibraryFlags {
    fn default() -> Self {
        LibraryFlags::ALL
    }
}

type LibFn = fn(&Thread) -> Result<usize, VmError>;

const BASE_FUNCTIONS: &[(&str, LibFn)] = &[
    ("print", base_print),
    ("type", base_type),
    ("typeof", base_typeof),
    ("tostring", base_tostring),
    ("tonumber", base_tonumber),
    ("error", base_error),
    ("pcall", base_pcall),
    ("select", base_select),
    ("rawequal", base_rawequal),
    ("rawget", base_rawget),
    ("rawset", base_rawset),
    ("rawlen", base_rawlen),
    ("setmetatable", base_setmetatable),
    ("getmetatable", base_getmetatable),
    ("next", base_next),
];

const TABLE_FUNCTIONS: &[(&str, LibFn)] = &[
    ("insert", table_insert),
    ("remove", table_remove),
    ("concat", table_concat),
    ("unpack", table_unpack),
];

const STRING_FUNCTIONS: &[(&str, LibFn)] = &[
    ("len", string_len),
    ("sub", string_sub),
    ("upper", string_upper),
    ("lower", string_lower),
    ("rep", string_rep),
];

impl Thread {
    /// Load the selected libraries into the globals table.
    pub fn open_libs(&self, flags: LibraryFlags) -> Result<(), VmError> {
        if flags.contains(LibraryFlags::BASE) {
            for &(name, f) in BASE_FUNCTIONS {
                self.push_function(name, f);
                self.set_global(name)?;
            }
            self.push(Value::Table(self.global().globals.clone()));
            self.set_global("_G")?;
            self.push_string("Luau");
            self.set_global("_VERSION")?;
        }
        if flags.contains(LibraryFlags::TABLE) {
            self.open_lib("table", TABLE_FUNCTIONS)?;
        }
        if flags.contains(LibraryFlags::STRING) {
            let lib = self.open_lib("string", STRING_FUNCTIONS)?;
            let metatable = self.new_table();
            let displaced = metatable.borrow_mut().set_str("__index", lib);
            drop(displaced);
            self.push_string("");
            self.insert(-2)?;
            self.set_metatable(-2)?;
            self.pop(1);
        }
        tracing::debug!(target: "variant_bridge_vm", vm = self.vm_id(), ?flags, "opened libraries");
        Ok(())
    }

    fn open_lib(&self, name: &str, functions: &[(&str, LibFn)]) -> Result<Value, VmError> {
        let lib = self.create_table(0, functions.len());
        for &(fname, f) in functions {
            self.push_function(fname, f);
            self.set_field(-2, fname)?;
        }
        self.set_global(name)?;
        Ok(Value::Table(lib))
    }
}

// ============================================================================
// Base library
// ============================================================================

fn base_print(t: &Thread) -> Result<usize, VmError> {
    let mut parts = Vec::new();
    for i in 1..=t.get_top() {
        parts.push(t.to_display_string(i)?);
    }
    tracing::info!(target: "variant_bridge_vm", "{}", parts.join("\t"));
    Ok(0)
}

fn base_type(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    t.push_string(t.type_name_at(1));
    Ok(1)
}

fn base_typeof(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    if t.type_of(1) == VmType::UserData && t.get_metafield(1, "__type") == VmType::String {
        return Ok(1);
    }
    t.push_string(t.type_name_at(1));
    Ok(1)
}

fn base_tostring(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    let s = t.to_display_string(1)?;
    t.push_string(&s);
    Ok(1)
}

fn base_tonumber(t: &Thread) -> Result<usize, VmError> {
    if t.is_nil(2) {
        t.check_any(1)?;
        match t.value_at(1).to_number() {
            Some(n) => t.push_number(n),
            None => t.push_nil(),
        }
        return Ok(1);
    }
    let base = t.check_number(2)?;
    if !(2.0..=36.0).contains(&base) {
        return Err(t.arg_error(2, "base out of range"));
    }
    let text = t.check_string(1)?.to_string_lossy();
    match i64::from_str_radix(text.trim(), base as u32) {
        Ok(n) => t.push_number(n as f64),
        Err(_) => t.push_nil(),
    }
    Ok(1)
}

fn base_error(t: &Thread) -> Result<usize, VmError> {
    Err(VmError::Runtime(t.value_at(1)))
}

fn base_pcall(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    let nargs = t.get_top() - 1;
    let ok = t.pcall(nargs, MULTRET).is_ok();
    t.push_boolean(ok);
    t.insert(1)?;
    Ok(t.get_top() as usize)
}

fn base_select(t: &Thread) -> Result<usize, VmError> {
    let n = t.get_top();
    if let Some(s) = t.to_string_atom(1).map(|(s, _)| s) {
        if s.as_bytes() == b"#" {
            t.push_integer((n - 1) as i64);
            return Ok(1);
        }
    }
    let i = t.check_number(1)? as i32;
    let i = if i < 0 { n + i } else if i > n { n } else { i };
    if i < 1 {
        return Err(t.arg_error(1, "index out of range"));
    }
    Ok((n - i) as usize)
}

fn base_rawequal(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    t.check_any(2)?;
    t.push_boolean(t.raw_equal(1, 2));
    Ok(1)
}

fn base_rawget(t: &Thread) -> Result<usize, VmError> {
    t.check_table(1)?;
    t.check_any(2)?;
    t.set_top(2);
    t.raw_get(1)?;
    Ok(1)
}

fn base_rawset(t: &Thread) -> Result<usize, VmError> {
    t.check_table(1)?;
    t.check_any(2)?;
    t.check_any(3)?;
    t.set_top(3);
    t.raw_set(1)?;
    Ok(1)
}

fn base_rawlen(t: &Thread) -> Result<usize, VmError> {
    match t.type_of(1) {
        VmType::Table | VmType::String => {
            t.push_integer(t.raw_len(1) as i64);
            Ok(1)
        }
        _ => Err(t.arg_error(1, "table or string expected")),
    }
}

fn base_setmetatable(t: &Thread) -> Result<usize, VmError> {
    t.check_table(1)?;
    if !matches!(t.type_of(2), VmType::Nil | VmType::Table) {
        return Err(t.type_error(2, "nil or table"));
    }
    if t.get_metafield(1, "__metatable") != VmType::Nil {
        return Err(VmError::runtime("cannot change a protected metatable"));
    }
    t.set_top(2);
    t.set_metatable(1)?;
    Ok(1)
}

fn base_getmetatable(t: &Thread) -> Result<usize, VmError> {
    t.check_any(1)?;
    if !t.get_metatable(1) {
        t.push_nil();
        return Ok(1);
    }
    t.get_metafield(1, "__metatable");
    Ok(1)
}

fn base_next(t: &Thread) -> Result<usize, VmError> {
    t.check_table(1)?;
    t.set_top(2);
    if t.next(1)? {
        Ok(2)
    } else {
        t.push_nil();
        Ok(1)
    }
}

// ============================================================================
// Table library
// ============================================================================

fn table_insert(t: &Thread) -> Result<usize, VmError> {
    let table = t.check_table(1)?;
    let n = table.borrow().len() as i64;
    match t.get_top() {
        2 => t.raw_set_i(1, n + 1)?,
        3 => {
            let pos = t.check_number(2)? as i64;
            if pos < 1 || pos > n + 1 {
                return Err(t.arg_error(2, "position out of bounds"));
            }
            for i in (pos..=n).rev() {
                t.raw_get_i(1, i)?;
                t.raw_set_i(1, i + 1)?;
            }
            t.raw_set_i(1, pos)?;
        }
        _ => return Err(VmError::runtime("wrong number of arguments to 'insert'")),
    }
    Ok(0)
}

fn table_remove(t: &Thread) -> Result<usize, VmError> {
    let table = t.check_table(1)?;
    let n = table.borrow().len() as i64;
    let pos = if t.get_top() >= 2 { t.check_number(2)? as i64 } else { n };
    if t.get_top() >= 2 && n + 1 != pos && (pos < 1 || pos > n + 1) {
        return Err(t.arg_error(2, "position out of bounds"));
    }
    t.raw_get_i(1, pos)?;
    for i in pos..n {
        t.raw_get_i(1, i + 1)?;
        t.raw_set_i(1, i)?;
    }
    if pos <= n {
        t.push_nil();
        t.raw_set_i(1, n)?;
    }
    Ok(1)
}

fn table_concat(t: &Thread) -> Result<usize, VmError> {
    let table = t.check_table(1)?;
    let sep = if t.is_nil(2) { Vec::new() } else { t.check_string(2)?.as_bytes().to_vec() };
    let first = t.opt_number(3, 1.0)? as i64;
    let last = if t.is_nil(4) { table.borrow().len() as i64 } else { t.check_number(4)? as i64 };
    let mut out = Vec::new();
    for i in first..=last {
        let item = table.borrow().get_int(i);
        match item {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Number(n) => out.extend_from_slice(format_number(n).as_bytes()),
            other => {
                return Err(VmError::runtime(format!(
                    "invalid value (at index {}) in table for 'concat': {}",
                    i,
                    other.type_of()
                )));
            }
        }
        if i != last {
            out.extend_from_slice(&sep);
        }
    }
    t.push_bytes(&out);
    Ok(1)
}

fn table_unpack(t: &Thread) -> Result<usize, VmError> {
    let table = t.check_table(1)?;
    let first = t.opt_number(2, 1.0)? as i64;
    let last = if t.is_nil(3) { table.borrow().len() as i64 } else { t.check_number(3)? as i64 };
    if first > last {
        return Ok(0);
    }
    let count = (last - first + 1) as usize;
    if count > i32::MAX as usize || !t.check_stack(count as i32) {
        return Err(VmError::runtime("too many results to unpack"));
    }
    for i in first..=last {
        let value = table.borrow().get_int(i);
        t.push(value);
    }
    Ok(count)
}

// ============================================================================
// String library
// ============================================================================

/// Resolve a Lua string position (negative counts from the end).
fn string_position(pos: i64, len: usize) -> i64 {
    if pos >= 0 { pos } else { (len as i64 + pos + 1).max(0) }
}

fn string_len(t: &Thread) -> Result<usize, VmError> {
    let s = t.check_string(1)?;
    t.push_integer(s.len() as i64);
    Ok(1)
}

fn string_sub(t: &Thread) -> Result<usize, VmError> {
    let s = t.check_string(1)?;
    let len = s.len();
    let start = string_position(t.opt_number(2, 1.0)? as i64, len).max(1);
    let end = string_position(t.opt_number(3, -1.0)? as i64, len).min(len as i64);
    if start > end {
        t.push_string("");
    } else {
        t.push_bytes(&s.as_bytes()[(start - 1) as usize..end as usize]);
    }
    Ok(1)
}

fn string_upper(t: &Thread) -> Result<usize, VmError> {
    let s = t.check_string(1)?;
    t.push_bytes(&s.as_bytes().to_ascii_uppercase());
    Ok(1)
}

fn string_lower(t: &Thread) -> Result<usize, VmError> {
    let s = t.check_string(1)?;
    t.push_bytes(&s.as_bytes().to_ascii_lowercase());
    Ok(1)
}

fn string_rep(t: &Thread) -> Result<usize, VmError> {
    let s = t.check_string(1)?;
    let n = t.check_number(2)?.max(0.0) as usize;
    let sep = if t.is_nil(3) { Vec::new() } else { t.check_string(3)?.as_bytes().to_vec() };
    let total = n.saturating_mul(s.len() + sep.len());
    if total > t.options().max_stack_slots.saturating_mul(64) {
        return Err(VmError::runtime("resulting string too large"));
    }
    let mut out = Vec::with_capacity(total);
    for i in 0..n {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(s.as_bytes());
    }
    t.push_bytes(&out);
    Ok(1)
}
