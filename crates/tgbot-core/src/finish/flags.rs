use bitflags::bitflags;

bitflags! {
    /// Behavior of a [`super::Finisher`].
    ///
    /// The `*_FAILED` bits are bookkeeping written by the finisher itself; they are
    /// stripped from flags passed to the constructor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FinishFlags: u8 {
        /// Contain panics raised by callbacks instead of propagating them.
        const PANIC_GUARD = 1 << 0;
        /// Close the session transaction after callbacks ran.
        const FINISH_SESSION_TRANSACTION = 1 << 1;
        /// Close the chat transaction after callbacks ran. Skipped if closing the
        /// session transaction was requested and failed.
        const FINISH_CHAT_TRANSACTION = 1 << 2;
        /// Set by the finisher: closing the session transaction failed.
        const SESSION_TRANSACTION_FAILED = 1 << 3;
        /// Set by the finisher: closing the chat transaction failed.
        const CHAT_TRANSACTION_FAILED = 1 << 4;
    }
}

impl FinishFlags {
    /// Bits a caller may request.
    pub const REQUESTABLE: Self = Self::PANIC_GUARD
        .union(Self::FINISH_SESSION_TRANSACTION)
        .union(Self::FINISH_CHAT_TRANSACTION);

    pub fn requested(self) -> Self {
        self.intersection(Self::REQUESTABLE)
    }
}
