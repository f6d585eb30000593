pub mod tag_parser;
