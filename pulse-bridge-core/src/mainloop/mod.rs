pub mod threaded;
