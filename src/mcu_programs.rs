//! MicroPython/CircuitPython source templates executed on the device
//!
//! Per spec §9 ("Dynamic code shipping"): the original host ships Python
//! function *source* to the device and calls it remotely. A statically
//! typed re-implementation cannot do that, so each remote operation here
//! is pre-authored MicroPython source *data* with `{}` placeholders filled
//! in by `format!` - never code generated from the host language's own
//! functions. Every template is grounded on the matching `_xxx` function in
//! `repl.py` / `fcopy.py` / `rsync.py`.

use crate::constants::BUFFER_SIZE;

/// Wrap a remote program `body` (which must assign to `output`, or leave it
/// undefined) the way `Repl.eval_func` wraps a Python function body: `cd /`
/// first so relative paths resolve from the filesystem root, then print
/// `output` if it is not `None`.
///
/// Mirrors:
/// ```python
/// func_str += 'import os\n'
/// func_str += 'os.chdir("/")\n'
/// func_str += 'output = ' + func.__name__ + '(' + args + ')\n'
/// func_str += 'if output != None: print(output)\n'
/// ```
pub fn wrap_eval_func(body: &str) -> String {
    format!("{body}\nimport os\nos.chdir('/')\nif output is not None:\n print(output)\n")
}

/// `_uid`: read the silicon ID and format it as colon-separated hex.
pub fn uid_program() -> String {
    wrap_eval_func(
        r#"try:
    import machine
    _id = machine.unique_id()
except:
    try:
        import microcontroller
        _id = microcontroller.cpu.uid
    except:
        _id = None
output = ":".join("{:02x}".format(x) for x in _id) if _id is not None else None"#,
    )
}

/// `_get_time`: return the device RTC as a `time.struct_time`-shaped tuple.
pub fn get_time_program() -> String {
    wrap_eval_func(
        r#"import time
output = tuple(time.localtime())"#,
    )
}

/// `_set_time`: set the device RTC from `host_epoch_secs` if skew exceeds
/// `tolerance` seconds. `local_time_tuple` is the host's
/// `time.localtime()`-shaped 9-tuple, rendered as a Python literal.
pub fn set_time_program(local_time_tuple: &str, tolerance: i64) -> String {
    wrap_eval_func(&format!(
        r#"import time
st = {local_time_tuple}
host = time.mktime(st)
local = time.time()
output = None
if abs(host - local) >= {tolerance}:
    try:
        import rtc
        rtc.RTC().datetime = st
    except ImportError:
        import machine
        st2 = list(st)
        st2.insert(3, st2[6])
        st2[7] = 0
        machine.RTC().datetime(st2[:8])"#
    ))
}

/// `_device_characteristics`: feature flags the host can use to adapt
/// transfer strategy.
pub fn device_characteristics_program() -> String {
    wrap_eval_func(
        r#"import sys, time
try:
    sys.stdout.buffer
    sys.stdin.buffer
    has_buffer = True
except AttributeError:
    has_buffer = False
try:
    import binascii
    has_binascii = True
except ImportError:
    has_binascii = False
st = (2000, 1, 1, 0, 0, 0, -1, -1, -1)
epoch = 946684800 - time.mktime(st)
output = {'has_buffer': has_buffer, 'has_binascii': has_binascii, 'time_offset': epoch}"#,
    )
}

/// `_file_size`: `stat(path)` size, or `-1` if missing.
pub fn file_size_program(path: &str) -> String {
    wrap_eval_func(&format!(
        r#"import os
try:
    output = os.stat({path})[6]
except:
    output = -1"#,
        path = py_repr(path)
    ))
}

/// `_makedirs`: recursive `mkdir`, retrying on `ENOENT` by creating parents.
pub fn makedirs_program(path: &str) -> String {
    wrap_eval_func(&format!(
        r#"import os
def _makedirs(path):
    try:
        os.mkdir(path)
        return True
    except OSError as e:
        if e.args[0] == 2:
            try:
                _makedirs(path[:path.rfind('/')])
                os.mkdir(path)
            except:
                return False
        else:
            return True
    return True
output = _makedirs({path})"#,
        path = py_repr(path)
    ))
}

/// `_rm_rf`: recursive delete guarded by `S_IFDIR` stat-mode check.
pub fn rm_rf_program(path: &str, recursive: bool) -> String {
    let recursive = if recursive { "True" } else { "False" };
    wrap_eval_func(&format!(
        r#"import os
def _rm_rf(path, recursive):
    try:
        mode = os.stat(path)[0]
        if mode & 0x4000 != 0:
            if recursive:
                for entry in os.listdir(path):
                    if not _rm_rf(path + '/' + entry, recursive):
                        return False
                os.rmdir(path)
        else:
            os.remove(path)
    except:
        return False
    return True
output = _rm_rf({path}, {recursive})"#,
        path = py_repr(path)
    ))
}

/// `_cat`: print a file line by line.
pub fn cat_program(path: &str) -> String {
    wrap_eval_func(&format!(
        r#"with open({path}) as f:
    while True:
        line = f.readline()
        if not line:
            break
        print(line, end="")
output = None"#,
        path = py_repr(path)
    ))
}

/// `_mcu_write`: receive `filesize` bytes of (optionally hexlified) file
/// content from the host over the channel and write them to `remote_file`,
/// ACKing (`0x06`) or NAKing (`0x07`) each `BUFFER_SIZE`-sized block.
pub fn mcu_write_program(remote_file: &str, filesize: u64, binary: bool) -> String {
    let binary = if binary { "True" } else { "False" };
    wrap_eval_func(&format!(
        r#"import sys
def _mcu_write(remote_file, filesize, binary):
    try:
        if binary:
            import binascii
        with open(remote_file, 'wb') as dst:
            remaining = filesize * 2 if binary else filesize
            buf = bytearray({buffer_size})
            while remaining > 0:
                size = min(remaining, {buffer_size})
                got = 0
                while got < size:
                    n = sys.stdin.readinto(buf, size - got)
                    if n:
                        got += n
                dst.write(binascii.unhexlify(buf[0:size]) if binary else buf[0:size])
                sys.stdout.write(b'\x06')
                remaining -= size
    except:
        sys.stdout.write(b'\x07')
        raise
    return True
output = _mcu_write({remote_file}, {filesize}, {binary})"#,
        buffer_size = BUFFER_SIZE,
        remote_file = py_repr(remote_file),
        filesize = filesize,
        binary = binary
    ))
}

/// `_mcu_read`: send `filesize` bytes of `remote_file` over the channel in
/// `BUFFER_SIZE` blocks, waiting for a host ACK between each.
pub fn mcu_read_program(remote_file: &str, filesize: u64) -> String {
    wrap_eval_func(&format!(
        r#"import sys
def _mcu_read(remote_file, filesize):
    with open(remote_file, 'rb') as src:
        remaining = filesize
        while remaining > 0:
            size = min(remaining, {buffer_size})
            buf = src.read(size)
            sys.stdout.buffer.write(buf)
            remaining -= size
            ack = sys.stdin.read(1)
            if ack != '\x06':
                raise ValueError('bad ack')
_mcu_read({remote_file}, {filesize})
output = None"#,
        buffer_size = BUFFER_SIZE,
        remote_file = py_repr(remote_file),
        filesize = filesize
    ))
}

/// `_mcu_list`: recursively enumerate `path`, printing one CSV line per
/// entry: ` kind,level,repr(path),mtime,size` (note leading space).
pub fn mcu_list_program(path: &str) -> String {
    wrap_eval_func(&format!(
        r#"import os
def _mcu_list(path, level):
    t_off = 0
    try:
        import machine
        t_off = 946684800
    except ImportError:
        pass
    try:
        st = os.stat(path)
        fsize = st[6]
        mtime = st[7] + t_off
        if st[0] & 0x4000:
            print(" D,{{}},{{}},{{}},0".format(level, repr(path), mtime))
            os.chdir(path)
            for entry in os.listdir():
                _mcu_list(entry, level + 1)
            try:
                os.chdir('..')
            except:
                pass
        else:
            print(" F,{{}},{{}},{{}},{{}}".format(level, repr(path), mtime, fsize))
    except:
        pass
_mcu_list({path}, 0)
output = None"#,
        path = py_repr(path)
    ))
}

/// Render a Rust string as a Python string literal (single-quoted,
/// backslash/quote escaped) - good enough for the filesystem paths and
/// timestamps these templates interpolate.
pub fn py_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn py_repr_escapes_quotes() {
        assert_eq!(py_repr("it's"), "'it\\'s'");
    }

    #[test]
    fn wrap_eval_func_prints_output_when_present() {
        let prog = wrap_eval_func("output = 42");
        assert!(prog.contains("if output is not None"));
        assert!(prog.contains("output = 42"));
    }
}
