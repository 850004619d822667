//! Runtime support library.
//!
//! Native helpers called by emitted code. Strings are length-prefixed
//! contiguous buffers (`i32` size, then bytes, no terminator); arrays are
//! `{ size: i32, capacity: i32, data: *mut u8 }` headers. Everything is
//! allocated with the host allocator so generated code can `realloc`
//! buffers it did not create.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

pub const STRING_HEADER: i64 = 4;
pub const ARRAY_SIZE_OFFSET: i32 = 0;
pub const ARRAY_CAPACITY_OFFSET: i32 = 4;
pub const ARRAY_DATA_OFFSET: i32 = 8;
pub const ARRAY_HEADER_SIZE: i64 = 16;

// ----------------------------------------------------------------------
// Raw string and array accessors
// ----------------------------------------------------------------------

unsafe fn str_size(s: *const u8) -> i32 {
    *(s as *const i32)
}

unsafe fn str_data(s: *const u8) -> *const u8 {
    s.add(4)
}

unsafe fn str_byte(s: *const u8, index: i32) -> u8 {
    *str_data(s).add(index as usize)
}

unsafe fn new_string(size: i32) -> *mut u8 {
    let ptr = libc::malloc(4 + size as usize) as *mut u8;
    *(ptr as *mut i32) = size;
    ptr
}

unsafe fn new_string_data(ptr: *mut u8) -> *mut u8 {
    ptr.add(4)
}

unsafe fn array_size(a: *const u8) -> i32 {
    *(a as *const i32)
}

unsafe fn new_array(size: i32, elem_size: usize) -> *mut u8 {
    let array = libc::malloc(ARRAY_HEADER_SIZE as usize) as *mut u8;
    *(array as *mut i32) = size;
    *(array.add(4) as *mut i32) = size;
    let data = libc::malloc(elem_size * size as usize) as *mut u8;
    *(array.add(8) as *mut *mut u8) = data;
    array
}

unsafe fn array_data(a: *const u8) -> *mut u8 {
    *(a.add(8) as *const *mut u8)
}

// ----------------------------------------------------------------------
// Logging sinks
// ----------------------------------------------------------------------

pub unsafe extern "C" fn log_int(n: i32) {
    println!("{}", n);
}

pub unsafe extern "C" fn log_float(n: f32) {
    println!("{}", n);
}

pub unsafe extern "C" fn log_char(n: i32) {
    println!("{}", (n as u8) as char);
}

pub unsafe extern "C" fn log_string(s: *const u8) {
    let bytes = std::slice::from_raw_parts(str_data(s), str_size(s) as usize);
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(b'\n');
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = lock.write_all(&out);
    let _ = lock.flush();
}

// ----------------------------------------------------------------------
// String casts for each primitive
// ----------------------------------------------------------------------

unsafe fn string_from(text: &str) -> *mut u8 {
    let ptr = new_string(text.len() as i32);
    std::ptr::copy_nonoverlapping(text.as_ptr(), new_string_data(ptr), text.len());
    ptr
}

pub unsafe extern "C" fn string_int_cast(n: i32) -> *mut u8 {
    string_from(&n.to_string())
}

pub unsafe extern "C" fn string_float_cast(n: f32) -> *mut u8 {
    string_from(&n.to_string())
}

pub unsafe extern "C" fn string_char_cast(n: i32) -> *mut u8 {
    string_from(&((n as u8) as char).to_string())
}

#[repr(C)]
struct StaticString<const N: usize> {
    size: i32,
    data: [u8; N],
}

static TRUE_STRING: StaticString<4> = StaticString { size: 4, data: *b"true" };
static FALSE_STRING: StaticString<5> = StaticString { size: 5, data: *b"false" };

pub unsafe extern "C" fn string_bool_cast(n: i32) -> *const u8 {
    if n != 0 {
        &TRUE_STRING as *const _ as *const u8
    } else {
        &FALSE_STRING as *const _ as *const u8
    }
}

// ----------------------------------------------------------------------
// String routines
// ----------------------------------------------------------------------

pub unsafe extern "C" fn string_equals(left: *const u8, right: *const u8) -> i32 {
    if str_size(left) != str_size(right) {
        return 0;
    }
    let left = std::slice::from_raw_parts(str_data(left), str_size(left) as usize);
    let right = std::slice::from_raw_parts(str_data(right), str_size(right) as usize);
    (left == right) as i32
}

pub unsafe extern "C" fn int_hash(n: i32) -> i32 {
    n
}

pub unsafe extern "C" fn float_hash(n: f32) -> i32 {
    n.to_bits() as i32
}

pub unsafe extern "C" fn float_sqrt(n: f32) -> f32 {
    let mut y = n;
    for _ in 0..5 {
        y = 0.5 * (y + n / y);
    }
    y
}

pub unsafe extern "C" fn string_hash(n: *const u8) -> i32 {
    let mut hash: u32 = 0x811c9dc5;
    for i in 0..str_size(n) {
        hash ^= str_byte(n, i) as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash as i32
}

pub unsafe extern "C" fn string_index_of(haystack: *const u8, needle: *const u8) -> i32 {
    if str_size(needle) == 0 {
        return 0;
    }

    let mut i = 0;
    while i <= str_size(haystack) - str_size(needle) {
        let mut matched = true;
        for j in 0..str_size(needle) {
            if str_byte(haystack, i + j) != str_byte(needle, j) {
                matched = false;
                break;
            }
        }
        if matched {
            return i;
        }
        i += 1;
    }

    -1
}

pub unsafe extern "C" fn string_count(haystack: *const u8, needle: *const u8) -> i32 {
    if str_size(needle) == 0 {
        return str_size(haystack) + 1;
    }

    let mut count = 0;
    let mut i = 0;
    while i <= str_size(haystack) - str_size(needle) {
        let mut matched = true;
        for j in 0..str_size(needle) {
            if str_byte(haystack, i + j) != str_byte(needle, j) {
                matched = false;
                break;
            }
        }
        if matched {
            count += 1;
            i += str_size(needle);
        } else {
            i += 1;
        }
    }

    count
}

pub unsafe extern "C" fn string_replace(
    input: *const u8,
    old: *const u8,
    new: *const u8,
) -> *const u8 {
    if old == new {
        return input;
    }

    let count = string_count(input, old);
    if count == 0 {
        return input;
    }

    let size = str_size(input) + count * (str_size(new) - str_size(old));
    let result = new_string(size);
    let out = new_string_data(result);

    if str_size(old) > 0 {
        let mut i = 0;
        let mut k = 0usize;
        while i < str_size(input) {
            let mut matched = true;
            for j in 0..str_size(old) {
                if i + j >= str_size(input) || str_byte(input, i + j) != str_byte(old, j) {
                    matched = false;
                    break;
                }
            }
            if matched {
                for j in 0..str_size(new) {
                    *out.add(k + j as usize) = str_byte(new, j);
                }
                i += str_size(old);
                k += str_size(new) as usize;
            } else {
                *out.add(k) = str_byte(input, i);
                i += 1;
                k += 1;
            }
        }
    } else {
        let mut i = 0;
        let mut k = 0usize;
        while i <= str_size(input) {
            for j in 0..str_size(new) {
                *out.add(k + j as usize) = str_byte(new, j);
            }
            if i < str_size(input) {
                k += str_size(new) as usize;
                *out.add(k) = str_byte(input, i);
            }
            k += 1;
            i += 1;
        }
    }

    result
}

pub unsafe extern "C" fn string_trim(input: *const u8) -> *const u8 {
    if str_size(input) == 0 {
        return input;
    }

    let mut start = 0;
    let mut end = str_size(input) - 1;

    while start < str_size(input) && str_byte(input, start).is_ascii_whitespace() {
        start += 1;
    }
    while end >= start && str_byte(input, end).is_ascii_whitespace() {
        end -= 1;
        if end < start {
            break;
        }
    }

    let size = (end - start + 1).max(0);
    let result = new_string(size);
    for (j, i) in (start..start + size).enumerate() {
        *new_string_data(result).add(j) = str_byte(input, i);
    }
    result
}

pub unsafe extern "C" fn string_starts_with(input: *const u8, target: *const u8) -> i32 {
    if str_size(target) == 0 {
        return 1;
    }
    if str_size(input) < str_size(target) {
        return 0;
    }
    for i in 0..str_size(target) {
        if str_byte(input, i) != str_byte(target, i) {
            return 0;
        }
    }
    1
}

pub unsafe extern "C" fn string_ends_with(input: *const u8, target: *const u8) -> i32 {
    if str_size(target) == 0 {
        return 1;
    }
    if str_size(input) < str_size(target) {
        return 0;
    }
    for i in 0..str_size(target) {
        if str_byte(input, str_size(input) - 1 - i) != str_byte(target, str_size(target) - 1 - i) {
            return 0;
        }
    }
    1
}

pub unsafe extern "C" fn string_contains(input: *const u8, target: *const u8) -> i32 {
    (string_index_of(input, target) != -1) as i32
}

pub unsafe extern "C" fn string_split(input: *const u8, delim: *const u8) -> *mut u8 {
    if str_size(delim) == 0 {
        let result = new_array(str_size(input), 8);
        let data = array_data(result) as *mut *mut u8;
        for i in 0..str_size(input) {
            let item = new_string(1);
            *new_string_data(item) = str_byte(input, i);
            *data.add(i as usize) = item;
        }
        return result;
    }

    let count = string_count(input, delim) + 1;
    let result = new_array(count, 8);
    let mut data = array_data(result) as *mut *mut u8;

    let mut current = 0;
    let mut previous = 0;

    while current <= str_size(input) - str_size(delim) {
        let mut matched = true;
        for j in 0..str_size(delim) {
            if str_byte(input, current + j) != str_byte(delim, j) {
                matched = false;
                break;
            }
        }

        if matched {
            let size = current - previous;
            let item = new_string(size);
            std::ptr::copy_nonoverlapping(
                str_data(input).add(previous as usize),
                new_string_data(item),
                size as usize,
            );
            *data = item;
            data = data.add(1);
            current += str_size(delim);
            previous = current;
        } else {
            current += 1;
        }
    }

    let size = str_size(input) - previous;
    let item = new_string(size);
    std::ptr::copy_nonoverlapping(
        str_data(input).add(previous as usize),
        new_string_data(item),
        size as usize,
    );
    *data = item;

    result
}

pub unsafe extern "C" fn string_join(input: *const u8, delim: *const u8) -> *mut u8 {
    if array_size(input) == 0 {
        return new_string(0);
    }

    let data = array_data(input) as *const *const u8;
    let count = array_size(input);

    let mut size = str_size(delim) * (count - 1);
    for i in 0..count {
        size += str_size(*data.add(i as usize));
    }

    let result = new_string(size);
    let out = new_string_data(result);

    let mut k = 0usize;
    for i in 0..count {
        let item = *data.add(i as usize);
        std::ptr::copy_nonoverlapping(str_data(item), out.add(k), str_size(item) as usize);
        k += str_size(item) as usize;
        if i != count - 1 {
            std::ptr::copy_nonoverlapping(str_data(delim), out.add(k), str_size(delim) as usize);
            k += str_size(delim) as usize;
        }
    }

    result
}

pub unsafe extern "C" fn string_to_array(input: *const u8) -> *mut u8 {
    let result = new_array(str_size(input), 1);
    std::ptr::copy_nonoverlapping(str_data(input), array_data(result), str_size(input) as usize);
    result
}

pub unsafe extern "C" fn string_pad(input: *const u8, pad: i32) -> *mut u8 {
    let size = pad + str_size(input);
    let result = new_string(size);
    let out = new_string_data(result);
    for i in 0..pad {
        *out.add(i as usize) = b' ';
    }
    std::ptr::copy_nonoverlapping(
        str_data(input),
        out.add(pad as usize),
        str_size(input) as usize,
    );
    result
}

// ----------------------------------------------------------------------
// Raw-memory pool behind alloc / write / read
// ----------------------------------------------------------------------

const POOL_CAPACITY: usize = 1 << 24;

struct Pool {
    base: *mut u8,
    used: usize,
}

unsafe impl Send for Pool {}

static POOL: Mutex<Pool> = Mutex::new(Pool { base: std::ptr::null_mut(), used: 0 });

fn pool_base() -> *mut u8 {
    let mut pool = POOL.lock().unwrap();
    if pool.base.is_null() {
        pool.base = unsafe { libc::malloc(POOL_CAPACITY) as *mut u8 };
    }
    pool.base
}

pub unsafe extern "C" fn pool_alloc(size: i32) -> i32 {
    pool_base();
    let mut pool = POOL.lock().unwrap();
    let offset = (pool.used + 7) & !7;
    pool.used = offset + size.max(0) as usize;
    offset as i32
}

pub unsafe extern "C" fn pool_reset() {
    POOL.lock().unwrap().used = 0;
}

pub unsafe extern "C" fn pool_used() -> i32 {
    POOL.lock().unwrap().used as i32
}

pub unsafe extern "C" fn pool_write_int(offset: i32, value: i32) {
    *(pool_base().add(offset as usize) as *mut i32) = value;
}

pub unsafe extern "C" fn pool_write_float(offset: i32, value: f32) {
    *(pool_base().add(offset as usize) as *mut f32) = value;
}

pub unsafe extern "C" fn pool_write_char(offset: i32, value: i32) {
    *pool_base().add(offset as usize) = value as u8;
}

pub unsafe extern "C" fn pool_write_bool(offset: i32, value: i32) {
    *pool_base().add(offset as usize) = (value != 0) as u8;
}

pub unsafe extern "C" fn pool_read_int(offset: i32) -> i32 {
    *(pool_base().add(offset as usize) as *const i32)
}

pub unsafe extern "C" fn pool_read_float(offset: i32) -> f32 {
    *(pool_base().add(offset as usize) as *const f32)
}

pub unsafe extern "C" fn pool_read_char(offset: i32) -> i32 {
    *pool_base().add(offset as usize) as i32
}

pub unsafe extern "C" fn pool_read_bool(offset: i32) -> i32 {
    (*pool_base().add(offset as usize) != 0) as i32
}

// ----------------------------------------------------------------------
// Panics and stack traces
// ----------------------------------------------------------------------

/// Payload unwound out of generated code into the nearest installed
/// frame.
#[derive(Debug, Clone)]
pub struct RuntimePanic {
    pub reason: String,
    pub line: i32,
    pub column: i32,
    /// Source-function names resolved from native return addresses.
    pub frames: Vec<String>,
}

struct CodeRange {
    base: usize,
    length: usize,
    name: String,
    owner: u64,
}

static CODE_RANGES: Mutex<Vec<CodeRange>> = Mutex::new(Vec::new());

/// Records the native range of a compiled function so panics can name it.
pub fn register_code_range(owner: u64, name: &str, base: *const u8, length: usize) {
    CODE_RANGES.lock().unwrap().push(CodeRange {
        base: base as usize,
        length,
        name: name.to_string(),
        owner,
    });
}

/// Drops every range recorded by a destroyed VM.
pub fn unregister_code_ranges(owner: u64) {
    CODE_RANGES.lock().unwrap().retain(|range| range.owner != owner);
}

fn resolve_frames() -> Vec<String> {
    let mut addresses = Vec::with_capacity(32);
    backtrace::trace(|frame| {
        addresses.push(frame.ip() as usize);
        addresses.len() < 32
    });

    let ranges = CODE_RANGES.lock().unwrap();
    let mut frames = Vec::new();
    for address in addresses {
        for range in ranges.iter() {
            if address.wrapping_sub(range.base) <= range.length {
                frames.push(range.name.clone());
            }
        }
    }
    frames
}

/// Runtime panic entry called from generated code. Captures the stack
/// trace while the native frames are still live, then unwinds to the
/// nearest installed frame.
pub unsafe extern "C-unwind" fn panic(
    reason: *const std::os::raw::c_char,
    line: i64,
    column: i64,
) -> ! {
    let reason = CStr::from_ptr(reason).to_string_lossy().into_owned();
    let frames = resolve_frames();
    panic::panic_any(RuntimePanic {
        reason,
        line: line as i32,
        column: column as i32,
        frames,
    });
}

/// Executes `body`, converting a runtime panic into an error value. The
/// previous panic hook is restored afterwards, so frames nest.
pub fn catch<R>(body: impl FnOnce() -> R) -> Result<R, RuntimePanic> {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(|info| {
        // Runtime panics are reported through the panic callback, not
        // the default hook.
        if info.payload().downcast_ref::<RuntimePanic>().is_none() {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            eprintln!("panicked at {}", location);
        }
    }));

    let result = panic::catch_unwind(AssertUnwindSafe(body));
    panic::set_hook(previous);

    match result {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<RuntimePanic>() {
            Ok(runtime) => Err(*runtime),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn as_str(ptr: *const u8) -> String {
        let bytes = std::slice::from_raw_parts(str_data(ptr), str_size(ptr) as usize);
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn string_equals_compares_contents() {
        unsafe {
            let a = string_from("hello");
            let b = string_from("hello");
            let c = string_from("world");
            assert_eq!(string_equals(a, b), 1);
            assert_eq!(string_equals(a, c), 0);
        }
    }

    #[test]
    fn index_of_and_count() {
        unsafe {
            let hay = string_from("abcabc");
            let needle = string_from("bc");
            let missing = string_from("xy");
            assert_eq!(string_index_of(hay, needle), 1);
            assert_eq!(string_index_of(hay, missing), -1);
            assert_eq!(string_count(hay, needle), 2);
        }
    }

    #[test]
    fn replace_grows_and_shrinks() {
        unsafe {
            let input = string_from("a.b.c");
            let dot = string_from(".");
            let dash = string_from("--");
            let replaced = string_replace(input, dot, dash);
            assert_eq!(as_str(replaced), "a--b--c");
        }
    }

    #[test]
    fn trim_strips_ascii_whitespace() {
        unsafe {
            let input = string_from("  hello \t");
            assert_eq!(as_str(string_trim(input) as *const u8), "hello");
        }
    }

    #[test]
    fn split_and_join_round_trip() {
        unsafe {
            let input = string_from("a,b,c");
            let comma = string_from(",");
            let parts = string_split(input, comma);
            assert_eq!(array_size(parts), 3);
            let joined = string_join(parts, comma);
            assert_eq!(as_str(joined), "a,b,c");
        }
    }

    #[test]
    fn pad_prefixes_spaces() {
        unsafe {
            let input = string_from("x");
            assert_eq!(as_str(string_pad(input, 3)), "   x");
        }
    }

    #[test]
    fn starts_and_ends_with() {
        unsafe {
            let input = string_from("hello");
            let he = string_from("he");
            let lo = string_from("lo");
            assert_eq!(string_starts_with(input, he), 1);
            assert_eq!(string_ends_with(input, lo), 1);
            assert_eq!(string_starts_with(input, lo), 0);
        }
    }

    #[test]
    fn bool_cast_uses_static_strings() {
        unsafe {
            assert_eq!(as_str(string_bool_cast(1)), "true");
            assert_eq!(as_str(string_bool_cast(0)), "false");
        }
    }

    #[test]
    fn string_hash_is_fnv1a() {
        unsafe {
            let empty = string_from("");
            assert_eq!(string_hash(empty) as u32, 0x811c9dc5);
        }
    }

    #[test]
    fn pool_round_trips_values() {
        unsafe {
            let a = pool_alloc(4);
            let b = pool_alloc(4);
            assert_ne!(a, b);
            pool_write_int(a, 42);
            pool_write_float(b, 1.5);
            assert_eq!(pool_read_int(a), 42);
            assert_eq!(pool_read_float(b), 1.5);
        }
    }

    #[test]
    fn catch_recovers_runtime_panics() {
        let caught = catch(|| unsafe {
            panic(b"Out of bounds access\0".as_ptr() as *const std::os::raw::c_char, 3, 7);
        });
        let error = caught.err().expect("panic should be caught");
        assert_eq!(error.reason, "Out of bounds access");
        assert_eq!(error.line, 3);
        assert_eq!(error.column, 7);
    }

    #[test]
    fn code_ranges_resolve_and_unregister() {
        register_code_range(99, "demo", 0x1000 as *const u8, 16);
        unregister_code_ranges(99);
        assert!(CODE_RANGES.lock().unwrap().iter().all(|r| r.owner != 99));
    }
}
