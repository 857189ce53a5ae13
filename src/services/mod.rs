pub mod approvals;
pub mod audit;
pub mod identifiers;
pub mod ledger;
pub mod notification_center;
pub mod property_requests;
