use std::ffi::CString;

use rquickjs::{Ctx, qjs};

use crate::error::{Error, Result};

/// Compile `source` as a global script, then run it once. The completion
/// value is discarded.
///
/// Parse failures come back as [`Error::Compilation`]; anything thrown while
/// running comes back as [`Error::Exception`].
pub fn compile_and_run(ctx: &Ctx<'_>, source: &str, file_name: &str) -> Result<()> {
    let source =
        CString::new(source).map_err(|_| Error::InvalidArgument("script contains a NUL byte"))?;
    let file_name = CString::new(file_name)
        .map_err(|_| Error::InvalidArgument("script name contains a NUL byte"))?;
    let raw = ctx.as_raw().as_ptr();

    // SAFETY: `raw` is the live context borrowed through `ctx`; `source` is
    // NUL-terminated and its length excludes the terminator.
    let compiled = unsafe {
        qjs::JS_Eval(
            raw,
            source.as_ptr(),
            source.as_bytes().len() as _,
            file_name.as_ptr(),
            (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as _,
        )
    };
    if is_exception(compiled) {
        return Err(Error::compilation_from_js_catch(ctx));
    }

    // SAFETY: `compiled` is the function object returned above;
    // `JS_EvalFunction` takes ownership of it.
    let completion = unsafe { qjs::JS_EvalFunction(raw, compiled) };
    if is_exception(completion) {
        return Err(Error::from_js_catch(ctx));
    }
    // SAFETY: `completion` is an owned value from the same context.
    unsafe { qjs::JS_FreeValue(raw, completion) };
    Ok(())
}

fn is_exception(value: qjs::JSValue) -> bool {
    // SAFETY: reading the tag of a value does not touch the heap.
    unsafe { qjs::JS_VALUE_GET_NORM_TAG(value) == qjs::JS_TAG_EXCEPTION }
}
