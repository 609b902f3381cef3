//! Operator-facing output macros.
//!
//! Results go to stdout so they can be piped; status lines (success,
//! warnings, progress) go to stderr so they never mix with results.

#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {
        print!("{}", format!($($arg)*));
    }
}

#[macro_export]
macro_rules! console_println {
    () => {
        println!();
    };
    ($($arg:tt)*) => {
        println!("{}", format!($($arg)*));
    }
}

#[macro_export]
macro_rules! console_error {
    ($($arg:tt)*) => {
        eprintln!("❌ {}", format!($($arg)*));
    }
}

#[macro_export]
macro_rules! console_error_with_details {
    ($main:expr, $details:expr) => {{
        eprintln!("❌ {}", $main);
        for detail in $details {
            eprintln!("   └─ {}", detail);
        }
    }};
}

#[macro_export]
macro_rules! console_success {
    ($($arg:tt)*) => {
        eprintln!("✓ {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! console_info {
    ($($arg:tt)*) => {
        eprintln!("ℹ {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! console_warning {
    ($($arg:tt)*) => {
        eprintln!("⚠ {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! console_progress {
    ($($arg:tt)*) => {
        eprintln!("▶ {}", format!($($arg)*));
    };
}
