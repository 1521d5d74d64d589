/// Cursor positioning operations, mirroring `MDB_cursor_op`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetRange,
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Number of distinct keys
    pub keys: usize,
    /// Number of key/data pairs, counting every duplicate
    pub entries: usize,
}

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data file at the last commit
    pub mapsize: usize,
    pub last_txnid: u64,
    pub max_readers: u32,
    pub num_readers: u32,
    /// Number of databases in the committed snapshot, including the main one
    pub num_dbs: u32,
}
