pub mod address;
pub mod name_record;
pub mod reference;
pub mod socket_info;
