use std::borrow::Cow;
use std::io;

use flint_core::error::{CoreError, ErrorCategory};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "flint.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "flint.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "flint.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "flint.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "flint.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "flint.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "flint.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为框架级 [`CoreError`]，并按内核错误码判定致命性。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {error}", kind.message)),
    )
    .with_cause(error)
    .with_category(category)
}

/// 读写可以独立失败；只有表明传输已不可用的错误才要求关闭通道。
fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => ErrorCategory::Io { fatal: true },
        _ => ErrorCategory::Io { fatal: false },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_fatal_partial_write_is_not() {
        let reset = map_io_error(
            WRITE,
            io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"),
        );
        assert!(reset.closes_channel());
        assert_eq!(reset.code(), "flint.transport.tcp.write_failed");

        let transient = map_io_error(
            WRITE,
            io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
        );
        assert!(!transient.closes_channel());
    }
}
