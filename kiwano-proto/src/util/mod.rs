pub(crate) use self::lines_iter::lines_iter;
pub(crate) use self::split_spaces::split_spaces;

mod lines_iter;
mod split_spaces;
