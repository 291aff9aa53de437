#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod report;
pub use report::*;

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
}
