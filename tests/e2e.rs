//! End-to-end scenarios: compile real programs, run them through the
//! JIT, and observe results through globals, compiled functions and the
//! panic callback.

use std::cell::RefCell;
use std::rc::Rc;

use sable::Vm;

fn compiled(source: &str) -> Vm {
    let mut vm = Vm::new();
    vm.load_str(source);
    let ok = vm.compile();
    if !ok {
        let messages: Vec<String> =
            vm.diagnostics().iter().map(|d| format!("{:?}: {}", d.span, d.message)).collect();
        panic!("compilation failed: {}", messages.join("; "));
    }
    vm
}

fn run(source: &str) -> Vm {
    let mut vm = compiled(source);
    assert!(vm.run(), "program panicked at runtime");
    vm
}

fn read_int(vm: &Vm, name: &str) -> i32 {
    let address = vm.get_variable(name).expect("global not found");
    unsafe { *(address as *const i32) }
}

fn read_bool(vm: &Vm, name: &str) -> bool {
    let address = vm.get_variable(name).expect("global not found");
    unsafe { *(address as *const u8) != 0 }
}

fn read_float(vm: &Vm, name: &str) -> f32 {
    let address = vm.get_variable(name).expect("global not found");
    unsafe { *(address as *const f32) }
}

fn read_string(vm: &Vm, name: &str) -> String {
    let address = vm.get_variable(name).expect("global not found");
    unsafe {
        let string = *(address as *const *const u8);
        assert!(!string.is_null());
        let size = *(string as *const i32);
        let bytes = std::slice::from_raw_parts(string.add(4), size as usize);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

type PanicLog = Rc<RefCell<Vec<(String, i32, i32)>>>;

fn with_panic_log(vm: &mut Vm) -> PanicLog {
    let log: PanicLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    vm.set_panic_callback(move |function, line, column| {
        sink.borrow_mut().push((function.to_string(), line, column));
    });
    log
}

#[test]
fn arithmetic_precedence() {
    let vm = run("x: int = 1 + 2 * 3\nlog(1 + 2 * 3)\n");
    assert_eq!(read_int(&vm, "x.int"), 7);
}

#[test]
fn array_push_and_index() {
    let source = "\
a: array<int> = []
a.push(10)
a.push(20)
total: int = a[0] + a[1]
count: int = a.length
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "total.int"), 30);
    assert_eq!(read_int(&vm, "count.int"), 2);
}

#[test]
fn string_concat_is_length_preserving() {
    let source = "\
s: string = \"he\" + \"l\" + \"lo\"
n: int = s.length
log(s)
log(s.length)
";
    let vm = run(source);
    assert_eq!(read_string(&vm, "s.string"), "hello");
    assert_eq!(read_int(&vm, "n.int"), 5);
}

#[test]
fn any_cast_returns_original_value() {
    let source = "\
x: any = 3
y: int = x as int
t: bool = x is int
f: bool = x is string
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "y.int"), 3);
    assert!(read_bool(&vm, "t.bool"));
    assert!(!read_bool(&vm, "f.bool"));
}

#[test]
fn invalid_any_cast_panics_with_span() {
    let mut vm = compiled("x: any = 3\ns: string = x as string\n");
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    let log = log.borrow();
    assert!(!log.is_empty());
    assert_eq!(log[0].0, "Invalid type cast");
    assert_eq!(log[0].1, 2, "panic should carry the cast's line");
}

#[test]
fn out_of_bounds_access_panics() {
    let mut vm = compiled("a: array<int> = []\nn: int = a[0]\n");
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    let log = log.borrow();
    assert_eq!(log[0].0, "Out of bounds access");
    assert_eq!(log[0].1, 2);
}

#[test]
fn empty_pop_panics() {
    let mut vm = compiled("a: array<int> = []\nn: int = a.pop()\n");
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    assert_eq!(log.borrow()[0].0, "Out of bounds access");
}

#[test]
fn division_by_zero_panics() {
    let mut vm = compiled("z: int = 0\nn: int = 10 / z\n");
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    assert_eq!(log.borrow()[0].0, "Division by zero");
}

#[test]
fn null_field_access_panics() {
    let source = "\
class Point:
    x: int
p: Point = null
n: int = p.x
";
    let mut vm = compiled(source);
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    assert_eq!(log.borrow()[0].0, "Null pointer access");
}

#[test]
fn custom_str_member_wins() {
    let source = "\
class Zed:
    __str__(this) -> string: return \"Z\"
z: Zed = Zed()
s: string = z as string
";
    let vm = run(source);
    assert_eq!(read_string(&vm, "s.string"), "Z");
}

#[test]
fn generated_stringification_lists_fields() {
    let source = "\
class Point:
    x: int = 1
    y: int = 2
p: Point = Point()
s: string = p as string
";
    let vm = run(source);
    assert_eq!(read_string(&vm, "s.string"), "Point(\n x = 1,\n y = 2\n)");
}

#[test]
fn push_then_pop_restores_length() {
    let source = "\
a: array<int> = []
a.push(7)
popped: int = a.pop()
n: int = a.length
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "popped.int"), 7);
    assert_eq!(read_int(&vm, "n.int"), 0);
}

#[test]
fn compiled_functions_are_callable_from_the_host() {
    let source = "\
adder(a: int, b: int) -> int:
    return a + b
";
    let mut vm = compiled(source);
    assert!(vm.run());
    let address = vm.get_function("adder.int(int, int)").expect("function not found");
    let adder: unsafe extern "C-unwind" fn(i32, i32) -> i32 =
        unsafe { std::mem::transmute(address) };
    let result = vm.try_catch(|| unsafe { adder(10, 10) });
    assert_eq!(result, Some(20));
}

#[test]
fn recursion() {
    let source = "\
fib(n: int) -> int:
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)
x: int = fib(10)
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "x.int"), 55);
}

#[test]
fn for_loop_with_continue() {
    let source = "\
sum: int = 0
for i: int = 0; i < 10; i += 1:
    if i % 2 == 1:
        continue
    sum += i
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "sum.int"), 20);
}

#[test]
fn while_loop_with_break() {
    let source = "\
n: int = 0
while true:
    n += 1
    if n == 5:
        break
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "n.int"), 5);
}

#[test]
fn user_overloads_resolve_by_argument_type() {
    let source = "\
pick(a: int) -> int:
    return 1
pick(a: float) -> int:
    return 2
x: int = pick(3)
y: int = pick(1.5)
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "x.int"), 1);
    assert_eq!(read_int(&vm, "y.int"), 2);
}

#[test]
fn logical_operators_short_circuit() {
    let source = "\
counter: int = 0
touch() -> bool:
    counter = counter + 1
    return true
a: bool = false and touch()
b: bool = true or touch()
c: bool = true and touch()
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "counter.int"), 1);
    assert!(!read_bool(&vm, "a.bool"));
    assert!(read_bool(&vm, "b.bool"));
    assert!(read_bool(&vm, "c.bool"));
}

#[test]
fn conditional_expression() {
    let source = "\
a: int = 3
b: int = 9
m: int = a if a > b else b
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "m.int"), 9);
}

#[test]
fn implicit_widening_to_float() {
    let source = "\
x: float = 1 + 0.5
y: float = 3
";
    let vm = run(source);
    assert_eq!(read_float(&vm, "x.float"), 1.5);
    assert_eq!(read_float(&vm, "y.float"), 3.0);
}

#[test]
fn string_methods() {
    let source = "\
s: string = \"hello\"
i: int = s.index_of(\"l\")
missing: int = s.index_of(\"zz\")
has: bool = s.contains(\"ell\")
trimmed: string = \"  pad  \".trim()
parts: array<string> = \"a,b,c\".split(\",\")
joined: string = parts.join(\"-\")
eq: bool = \"abc\" == \"a\" + \"bc\"
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "i.int"), 2);
    assert_eq!(read_int(&vm, "missing.int"), -1);
    assert!(read_bool(&vm, "has.bool"));
    assert_eq!(read_string(&vm, "trimmed.string"), "pad");
    assert_eq!(read_string(&vm, "joined.string"), "a-b-c");
    assert!(read_bool(&vm, "eq.bool"));
}

#[test]
fn char_array_builds_strings() {
    let source = "\
buffer: array<char> = []
buffer.push(\"ab\")
buffer.push(\"c\")
s: string = buffer.to_string()
";
    let vm = run(source);
    assert_eq!(read_string(&vm, "s.string"), "abc");
}

#[test]
fn template_functions_instantiate_by_inference() {
    let source = "\
first<T>(values: array<T>) -> T:
    return values[0]
a: array<int> = []
a.push(7)
x: int = first(a)
y: int = first(a)
";
    let mut vm = compiled(source);
    assert!(vm.run());
    assert_eq!(read_int(&vm, "x.int"), 7);
    assert_eq!(read_int(&vm, "y.int"), 7);
    // Both uses share a single instantiation.
    assert!(vm.get_function("first<int>.int(array<int>)").is_some());
}

#[test]
fn classes_with_initializers_and_methods() {
    let source = "\
class Point:
    x: int
    y: int
    __init__(this, a: int, b: int):
        x = a
        y = b
    sum(this) -> int:
        return x + y
p: Point = Point(3, 4)
s: int = p.sum()
px: int = p.x
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "s.int"), 7);
    assert_eq!(read_int(&vm, "px.int"), 3);
}

#[test]
fn registered_externals_are_callable() {
    use std::sync::Mutex;
    static SEEN: Mutex<Vec<i32>> = Mutex::new(Vec::new());

    unsafe extern "C" fn sink(n: i32) {
        SEEN.lock().unwrap().push(n);
    }

    let mut vm = Vm::new();
    vm.register_function("void sink(int n)", sink as *const u8);
    vm.load_str("sink(41)\nsink(42)\n");
    assert!(vm.compile(), "diagnostics: {:?}", vm.diagnostics());
    assert!(vm.run());

    let seen = SEEN.lock().unwrap();
    assert_eq!(&*seen, &[41, 42]);
}

#[test]
fn nested_array_stringification() {
    let source = "\
m: array<array<int>> = [[1], [2]]
s: string = m as string
";
    let vm = run(source);
    let text = read_string(&vm, "s.string");
    assert!(text.starts_with("[\n"), "nested arrays open multi-line: {:?}", text);
    assert!(text.contains("[1]"), "inner arrays render inline: {:?}", text);
}

#[test]
fn stack_trace_names_compiled_functions() {
    let source = "\
boom(a: array<int>) -> int:
    return a[3]
a: array<int> = []
n: int = boom(a)
";
    let mut vm = compiled(source);
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    let log = log.borrow();
    assert_eq!(log[0].0, "Out of bounds access");
    let frames: Vec<&str> = log[1..].iter().map(|f| f.0.as_str()).collect();
    assert!(
        frames.iter().any(|f| f.contains("boom")),
        "stack trace should name the faulting function: {:?}",
        frames
    );
}

#[test]
fn type_mismatch_is_reported() {
    let mut vm = Vm::new();
    vm.load_str("x: int = 1 + true\n");
    assert!(!vm.compile());
    assert!(vm.diagnostics().iter().any(|d| d.message.contains("Type mismatch")));
}

#[test]
fn missing_return_is_reported() {
    let source = "\
f(a: int) -> int:
    if a > 0:
        return 1
";
    let mut vm = Vm::new();
    vm.load_str(source);
    assert!(!vm.compile());
    assert!(vm
        .diagnostics()
        .iter()
        .any(|d| d.message.contains("return on all paths")));
}

#[test]
fn break_outside_loop_is_reported() {
    let mut vm = Vm::new();
    vm.load_str("break\n");
    assert!(!vm.compile());
}

#[test]
fn bitwise_and_shifts() {
    let source = "\
a: int = 6 & 3
b: int = 6 | 3
c: int = 6 ^ 3
d: int = 1 << 4
e: int = 32 >> 2
f: int = ~0
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "a.int"), 2);
    assert_eq!(read_int(&vm, "b.int"), 7);
    assert_eq!(read_int(&vm, "c.int"), 5);
    assert_eq!(read_int(&vm, "d.int"), 16);
    assert_eq!(read_int(&vm, "e.int"), 8);
    assert_eq!(read_int(&vm, "f.int"), -1);
}

#[test]
fn load_file_and_import() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.sb");
    let main = dir.path().join("main.sb");

    let mut file = std::fs::File::create(&lib).unwrap();
    writeln!(file, "double(n: int) -> int:").unwrap();
    writeln!(file, "    return n * 2").unwrap();

    let mut file = std::fs::File::create(&main).unwrap();
    writeln!(file, "import \"lib.sb\"").unwrap();
    writeln!(file, "x: int = double(21)").unwrap();

    let mut vm = Vm::new();
    assert!(vm.load_file(&main));
    assert!(vm.compile(), "diagnostics: {:?}", vm.diagnostics());
    assert!(vm.run());
    assert_eq!(read_int(&vm, "x.int"), 42);
}

#[test]
fn array_reserve_defaults_every_slot() {
    let source = "\
a: array<int> = []
a.reserve(3)
n: int = a.length
z: int = a[2]
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "n.int"), 3);
    assert_eq!(read_int(&vm, "z.int"), 0);
}

#[test]
fn negative_reserve_panics() {
    let mut vm = compiled("a: array<int> = []\na.reserve(0 - 1)\n");
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    assert_eq!(log.borrow()[0].0, "Invalid reservation amount");
}

#[test]
fn function_pointers_call_and_null_check() {
    let source = "\
adder(a: int, b: int) -> int:
    return a + b
f: func<int, int, int> = adder
x: int = f(20, 22)
";
    let vm = run(source);
    assert_eq!(read_int(&vm, "x.int"), 42);

    let mut vm = compiled(
        "adder(a: int, b: int) -> int:\n    return a + b\nf: func<int, int, int> = null\nx: int = f(1, 2)\n",
    );
    let log = with_panic_log(&mut vm);
    assert!(!vm.run());
    assert_eq!(log.borrow()[0].0, "Null pointer call");
}
