pub mod fpga;
