use std::{cell::RefCell, ffi::c_char};

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

const SUCCESS: &str = "Success";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Env(#[from] jsenv::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status returned by every fallible `jsenv_*` call. Zero is success, every
/// failure class has its own negative value.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    NoEnv = -1,
    NoEnvironment = -2,
    NoScript = -3,
    NoIsolate = -4,
    Compilation = -5,
    Exception = -6,
    Timeout = -7,
    InvalidArgument = -8,
    NotInitialized = -9,
    ShutDown = -10,
    Busy = -11,
    Reentrant = -12,
    Internal = -13,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidArgument(_) => Self::InvalidArgument,
            Error::Env(err) => match err {
                jsenv::Error::NoEnv => Self::NoEnv,
                jsenv::Error::NoEnvironment => Self::NoEnvironment,
                jsenv::Error::NoScript => Self::NoScript,
                jsenv::Error::NoIsolate => Self::NoIsolate,
                jsenv::Error::Compilation { .. } => Self::Compilation,
                jsenv::Error::Exception { .. } => Self::Exception,
                jsenv::Error::Timeout => Self::Timeout,
                jsenv::Error::InvalidArgument(_) => Self::InvalidArgument,
                jsenv::Error::NotInitialized => Self::NotInitialized,
                jsenv::Error::ShutDown => Self::ShutDown,
                jsenv::Error::Busy { .. } => Self::Busy,
                jsenv::Error::Reentrant => Self::Reentrant,
                jsenv::Error::Engine(_) => Self::Internal,
            },
        }
    }
}

/// Record `err` as the outcome of the current call and return its status.
pub fn fail(err: impl Into<Error>) -> ErrorCode {
    let err = err.into();
    set_message(&err.to_string());
    ErrorCode::from(&err)
}

pub fn set_success() {
    set_message(SUCCESS);
}

fn set_message(message: &str) {
    LAST_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.clear();
        slot.push_str(message);
    });
}

/// Copy the last message into `buffer` and return the size needed to hold
/// all of it, terminator included.
///
/// # Safety
///
/// `buffer` must be null or valid for `size` bytes of writes.
pub unsafe fn copy_last_error(buffer: *mut c_char, size: u64) -> u64 {
    LAST_ERROR.with(|slot| unsafe { copy_to_buffer(&slot.borrow(), buffer, size) })
}

unsafe fn copy_to_buffer(message: &str, buffer: *mut c_char, size: u64) -> u64 {
    let bytes = message.as_bytes();
    let required = bytes.len() as u64 + 1;
    if buffer.is_null() || size == 0 {
        return required;
    }

    let capacity = usize::try_from(size).unwrap_or(usize::MAX);
    let len = bytes.len().min(capacity - 1);
    // `len + 1 <= size`, which the caller guarantees is writable.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), buffer, len);
        buffer.add(len).write(0);
    }
    required
}
