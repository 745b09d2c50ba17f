use std::ffi::CStr;

/// Name of the symbol containing `addr`, as far as the dynamic linker knows.
pub fn identify(addr: usize) -> Option<&'static CStr> {
    if addr == 0 {
        return None;
    }

    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();

        if libc::dladdr(addr as _, &mut info) == 0 {
            return None;
        }

        if !info.dli_sname.is_null() {
            let sym_name = CStr::from_ptr(info.dli_sname);
            return Some(sym_name);
        }

        None
    }
}
