pub mod resolution {
    pub const UNAVAILABLE: &str = "NRM101";
    pub const BUILD_FAILED: &str = "NRM102";
    pub const QUERY_FAILED: &str = "NRM103";
    pub const MALFORMED_OUTPUT: &str = "NRM104";
    pub const AMBIGUOUS_INSTALLABLE: &str = "NRM105";
    pub const INVALID_PATH: &str = "NRM106";
    pub const GRAPH: &str = "NRM107";
    pub const LISTING: &str = "NRM108";
}

pub mod rewrite {
    pub const MAPPING: &str = "NRM201";
    pub const AMBIGUOUS_REFERENCE: &str = "NRM202";
    pub const RESIDUAL_REFERENCE: &str = "NRM203";
    pub const IO: &str = "NRM204";
    pub const CACHE: &str = "NRM205";
    pub const SCANNER: &str = "NRM206";
}

pub mod transfer {
    pub const CONNECT: &str = "NRM301";
    pub const MANIFEST_QUERY: &str = "NRM302";
    pub const MALFORMED_MANIFEST: &str = "NRM303";
    pub const VERIFICATION_MISMATCH: &str = "NRM304";
    pub const PUBLISH: &str = "NRM305";
    pub const ARCHIVE: &str = "NRM306";
}

pub mod launch {
    pub const NO_COMMAND: &str = "NRM401";
    pub const COMMAND_NOT_FOUND: &str = "NRM402";
    pub const SESSION_DROPPED: &str = "NRM403";
    pub const SPAWN: &str = "NRM404";
}

pub const CANCELLED: &str = "NRM000";
