pub use jsenv_c_api::*;
